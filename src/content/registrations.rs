//! Event registration with capacity accounting, and attendance check-in.

use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};

use super::{
    event_path, key_of, now_millis, registration_path, registrations_path, required,
    with_uploaded,
};
use crate::capacity;
use crate::db::models::{Event, EventStatus, Keyed, Registration};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::storage::{BlobKey, BlobStore, Upload};
use crate::tree::{DataPath, DataTree, TreeTxn};

/// What a user fills in to sign up for an event.
#[derive(Debug)]
pub struct RegistrationInput {
    pub name: String,
    pub whatsapp: String,
    pub number_of_guests: u32,
    pub special_requests: String,
    pub is_paid: bool,
    pub payment_proof: Option<Upload>,
}

impl Default for RegistrationInput {
    fn default() -> Self {
        Self {
            name: String::new(),
            whatsapp: String::new(),
            number_of_guests: 1,
            special_requests: String::new(),
            is_paid: false,
            payment_proof: None,
        }
    }
}

/// Register `user` for an event. The payment proof, if any, is uploaded
/// before the capacity-checked write and removed again if that write fails.
pub async fn register(
    tree: &DataTree,
    blobs: &BlobStore,
    user: &CurrentUser,
    event_id: &str,
    input: RegistrationInput,
    today: NaiveDate,
) -> AppResult<Keyed<Registration>> {
    let name = required("Name", &input.name)?;
    let whatsapp = required("WhatsApp number", &input.whatsapp)?;
    if input.number_of_guests < 1 {
        return Err(AppError::BadRequest(
            "Number of guests must be at least 1".into(),
        ));
    }
    let proof = match (input.is_paid, input.payment_proof.as_ref()) {
        (true, Some(upload)) => Some((
            BlobKey::payment_proof(
                event_id,
                &user.uid,
                now_millis(),
                upload.extension().as_deref(),
            )?,
            upload,
        )),
        (true, None) => {
            return Err(AppError::BadRequest(
                "A payment proof is required for paid registrations".into(),
            ))
        }
        (false, _) => None,
    };

    // Fail fast before uploading anything; the transaction checks again
    let event: Event = tree
        .get_as(&event_path(event_id)?)?
        .ok_or(AppError::NotFound)?;
    ensure_open(&event, today)?;
    capacity::admit(
        event.max_participants,
        event.current_participants,
        input.number_of_guests,
    )?;

    let registration = Registration {
        event_id: event_id.to_string(),
        user_id: user.uid.clone(),
        name,
        email: user.email.clone(),
        whatsapp,
        number_of_guests: input.number_of_guests,
        special_requests: input.special_requests.trim().to_string(),
        is_paid: input.is_paid,
        payment_proof_ref: None,
        attended: false,
        attended_at: None,
        attendance_photo_ref: None,
        registered_at: Utc::now(),
    };

    with_uploaded(blobs, proof, |proof_ref| {
        commit_registration(
            tree,
            event_id,
            Registration {
                payment_proof_ref: proof_ref.cloned(),
                ..registration
            },
            today,
        )
    })
    .await
}

/// Admit a registration against the event's current count and store it,
/// all in one transaction.
pub fn commit_registration(
    tree: &DataTree,
    event_id: &str,
    registration: Registration,
    today: NaiveDate,
) -> AppResult<Keyed<Registration>> {
    let event_node = event_path(event_id)?;
    let parent = registrations_path(event_id)?;

    let (path, count) = tree.transaction(|txn| -> AppResult<_> {
        let event: Event = txn.get_as(&event_node)?.ok_or(AppError::NotFound)?;
        ensure_open(&event, today)?;

        let count = capacity::admit(
            event.max_participants,
            event.current_participants,
            registration.number_of_guests,
        )?;
        txn.set(&event_node.child("currentParticipants")?, &count)?;
        let path = txn.push(&parent, &registration)?;
        Ok((path, count))
    })?;

    let id = key_of(&path);
    tracing::info!(
        event = %event_id,
        registration = %id,
        guests = registration.number_of_guests,
        participants = count,
        "Registration admitted"
    );
    Ok(Keyed {
        id,
        value: registration,
    })
}

/// Delete a registration and give its spots back to the event, then remove
/// its payment proof and attendance photo.
pub async fn cancel_registration(
    tree: &DataTree,
    blobs: &BlobStore,
    user: &CurrentUser,
    event_id: &str,
    id: &str,
) -> AppResult<()> {
    let event_node = event_path(event_id)?;
    let path = registration_path(event_id, id)?;

    let registration = tree.transaction(|txn| -> AppResult<Registration> {
        let registration = owned_registration(txn, user, &path)?;
        txn.remove(&path)?;

        if let Some(event) = txn.get_as::<Event>(&event_node)? {
            let count = capacity::release(
                event.current_participants,
                registration.number_of_guests,
            );
            txn.set(&event_node.child("currentParticipants")?, &count)?;
        }
        Ok(registration)
    })?;

    tracing::info!(
        event = %event_id,
        registration = %id,
        guests = registration.number_of_guests,
        "Registration cancelled"
    );
    for key in [
        &registration.payment_proof_ref,
        &registration.attendance_photo_ref,
    ]
    .into_iter()
    .flatten()
    {
        blobs.discard(key).await;
    }
    Ok(())
}

/// Registrations of one event: all of them for admins, only their own for
/// everyone else.
pub fn list_registrations(
    tree: &DataTree,
    user: &CurrentUser,
    event_id: &str,
) -> AppResult<Vec<Keyed<Registration>>> {
    if tree.get(&event_path(event_id)?)?.is_none() {
        return Err(AppError::NotFound);
    }
    let mut registrations: Vec<Keyed<Registration>> =
        tree.children_as(&registrations_path(event_id)?)?;
    if !user.is_admin() {
        registrations.retain(|r| r.value.user_id == user.uid);
    }
    Ok(registrations)
}

/// Whether attendees may check in at `now`: on the event's day, from
/// `window` before the start time up to the start time.
pub fn check_in_open(event: &Event, now: NaiveDateTime, window: Duration) -> bool {
    let Some(starts_at) = event.starts_at() else {
        return false;
    };
    now.date() == starts_at.date() && now >= starts_at - window && now <= starts_at
}

/// Record attendance with a photo. Admins may check anyone in at any time;
/// attendees only inside the check-in window.
#[allow(clippy::too_many_arguments)]
pub async fn confirm_attendance(
    tree: &DataTree,
    blobs: &BlobStore,
    user: &CurrentUser,
    event_id: &str,
    id: &str,
    photo: Upload,
    now: NaiveDateTime,
    window_minutes: i64,
) -> AppResult<Keyed<Registration>> {
    let path = registration_path(event_id, id)?;
    let registration: Registration = tree.get_as(&path)?.ok_or(AppError::NotFound)?;
    if !user.may_act_for(&registration.user_id) {
        return Err(AppError::Forbidden);
    }
    let event: Event = tree
        .get_as(&event_path(event_id)?)?
        .ok_or(AppError::NotFound)?;
    if !user.is_admin() && !check_in_open(&event, now, Duration::minutes(window_minutes)) {
        return Err(AppError::Conflict(format!(
            "Check-in opens {} minutes before the event starts and closes when it starts",
            window_minutes
        )));
    }

    let key = BlobKey::attendance_photo(event_id, id, photo.extension().as_deref())?;
    let (previous, registration) = with_uploaded(blobs, Some((key, &photo)), |photo_ref| {
        tree.transaction(|txn| -> AppResult<_> {
            let before = owned_registration(txn, user, &path)?;
            let mut fields = Map::new();
            fields.insert("attended".into(), Value::Bool(true));
            fields.insert("attendedAt".into(), json!(Utc::now()));
            fields.insert("attendancePhotoRef".into(), json!(photo_ref));
            txn.update(&path, fields)?;
            let after: Registration = txn.get_as(&path)?.ok_or(AppError::NotFound)?;
            Ok((before.attendance_photo_ref, after))
        })
    })
    .await?;

    // A retake in another format lands under a different key
    if let Some(old) = &previous {
        if registration.attendance_photo_ref.as_ref() != Some(old) {
            blobs.discard(old).await;
        }
    }

    tracing::info!(event = %event_id, registration = %id, "Attendance confirmed");
    Ok(Keyed {
        id: id.to_string(),
        value: registration,
    })
}

/// Reset attendance and delete the check-in photo.
pub async fn undo_attendance(
    tree: &DataTree,
    blobs: &BlobStore,
    user: &CurrentUser,
    event_id: &str,
    id: &str,
) -> AppResult<Keyed<Registration>> {
    let path = registration_path(event_id, id)?;
    let (photo, registration) = tree.transaction(|txn| -> AppResult<_> {
        let before = owned_registration(txn, user, &path)?;
        let mut fields = Map::new();
        fields.insert("attended".into(), Value::Bool(false));
        fields.insert("attendedAt".into(), Value::Null);
        fields.insert("attendancePhotoRef".into(), Value::Null);
        txn.update(&path, fields)?;
        let after: Registration = txn.get_as(&path)?.ok_or(AppError::NotFound)?;
        Ok((before.attendance_photo_ref, after))
    })?;

    if let Some(key) = &photo {
        blobs.discard(key).await;
    }
    tracing::info!(event = %event_id, registration = %id, "Attendance undone");
    Ok(Keyed {
        id: id.to_string(),
        value: registration,
    })
}

fn ensure_open(event: &Event, today: NaiveDate) -> AppResult<()> {
    if event.status != EventStatus::Active {
        return Err(AppError::Conflict(format!(
            "This event is {}",
            event.status
        )));
    }
    if event.is_past(today) {
        return Err(AppError::Conflict(
            "This event has already taken place".into(),
        ));
    }
    Ok(())
}

fn owned_registration(
    txn: &TreeTxn<'_>,
    user: &CurrentUser,
    path: &DataPath,
) -> AppResult<Registration> {
    let registration: Registration = txn.get_as(path)?.ok_or(AppError::NotFound)?;
    if user.may_act_for(&registration.user_id) {
        Ok(registration)
    } else {
        Err(AppError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityError;
    use crate::content::events::{create_event, get_event, set_status, tests::input};
    use crate::content::tests::{fixture, image};
    use crate::db::models::Role;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 5, 1).unwrap()
    }

    fn user(uid: &str) -> CurrentUser {
        CurrentUser {
            uid: uid.into(),
            email: format!("{}@example.com", uid),
            role: Role::User,
        }
    }

    fn admin() -> CurrentUser {
        CurrentUser {
            uid: "boss".into(),
            email: "boss@example.com".into(),
            role: Role::Admin,
        }
    }

    fn form(guests: u32) -> RegistrationInput {
        RegistrationInput {
            name: "Ann".into(),
            whatsapp: "+62 811 000".into(),
            number_of_guests: guests,
            ..RegistrationInput::default()
        }
    }

    fn event_with(tree: &DataTree, max: u32, current: u32) -> String {
        let id = create_event(tree, input("2030-05-10", "18:00", max))
            .unwrap()
            .event
            .id;
        tree.set(
            &event_path(&id).unwrap().child("currentParticipants").unwrap(),
            &current,
        )
        .unwrap();
        id
    }

    fn participants(tree: &DataTree, id: &str) -> u32 {
        get_event(tree, id).unwrap().event.value.participants()
    }

    #[tokio::test]
    async fn admits_up_to_exact_capacity() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 8);

        let reg = register(&fx.tree, &fx.blobs, &user("u1"), &id, form(2), today())
            .await
            .unwrap();

        assert_eq!(participants(&fx.tree, &id), 10);
        assert_eq!(reg.value.email, "u1@example.com");
        assert_eq!(reg.value.number_of_guests, 2);
        assert!(get_event(&fx.tree, &id).unwrap().is_full);
    }

    #[tokio::test]
    async fn rejects_over_capacity_without_changing_count() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 9);

        let err = register(&fx.tree, &fx.blobs, &user("u1"), &id, form(2), today())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Cannot register 2 guests. Only 1 spot remaining.");
        assert_eq!(participants(&fx.tree, &id), 9);
        assert!(list_registrations(&fx.tree, &admin(), &id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_event_is_rejected() {
        let fx = fixture();
        let id = event_with(&fx.tree, 3, 3);
        let err = register(&fx.tree, &fx.blobs, &user("u1"), &id, form(1), today())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Capacity(CapacityError::Full)));
    }

    #[tokio::test]
    async fn validates_form() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);

        let cases = [
            RegistrationInput {
                name: " ".into(),
                ..form(1)
            },
            RegistrationInput {
                whatsapp: String::new(),
                ..form(1)
            },
            form(0),
            RegistrationInput {
                is_paid: true,
                ..form(1)
            },
        ];
        for case in cases {
            let err = register(&fx.tree, &fx.blobs, &user("u1"), &id, case, today())
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::BadRequest(_)));
        }
        assert_eq!(participants(&fx.tree, &id), 0);
    }

    #[tokio::test]
    async fn closed_past_or_missing_events_refuse_registrations() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);

        let late = NaiveDate::from_ymd_opt(2030, 5, 11).unwrap();
        let err = register(&fx.tree, &fx.blobs, &user("u1"), &id, form(1), late)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        set_status(&fx.tree, &id, EventStatus::Closed).unwrap();
        let err = register(&fx.tree, &fx.blobs, &user("u1"), &id, form(1), today())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(msg) if msg == "This event is closed"));

        let err = register(&fx.tree, &fx.blobs, &user("u1"), "missing", form(1), today())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn paid_registration_stores_proof() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);
        let paid = RegistrationInput {
            is_paid: true,
            payment_proof: Some(image("receipt.png")),
            ..form(1)
        };

        let reg = register(&fx.tree, &fx.blobs, &user("u1"), &id, paid, today())
            .await
            .unwrap();

        let proof = reg.value.payment_proof_ref.clone().unwrap();
        assert!(proof
            .as_str()
            .starts_with(&format!("payment-proofs/{}/u1-", id)));
        assert!(proof.as_str().ends_with(".png"));
        assert_eq!(BlobStore::content_type(&proof), "image/png");
        assert!(fx.blobs.get(&proof).await.unwrap().is_some());
    }

    fn sample(event_id: &str, uid: &str, guests: u32) -> Registration {
        Registration {
            event_id: event_id.into(),
            user_id: uid.into(),
            name: "Guest".into(),
            email: format!("{}@example.com", uid),
            whatsapp: "123".into(),
            number_of_guests: guests,
            special_requests: String::new(),
            is_paid: false,
            payment_proof_ref: None,
            attended: false,
            attended_at: None,
            attendance_photo_ref: None,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn concurrent_registrations_never_oversell() {
        let fx = fixture();
        let id = event_with(&fx.tree, 5, 0);

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let tree = fx.tree.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    commit_registration(&tree, &id, sample(&id, &format!("u{}", i), 1), today())
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 5);
        assert!(outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AppError::Capacity(CapacityError::Full))));
        assert_eq!(participants(&fx.tree, &id), 5);
        assert_eq!(list_registrations(&fx.tree, &admin(), &id).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn cancel_releases_spots_and_floors_at_zero() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);
        let reg = commit_registration(&fx.tree, &id, sample(&id, "u1", 3), today()).unwrap();
        assert_eq!(participants(&fx.tree, &id), 3);

        // Count drifted below what this registration holds
        fx.tree
            .set(
                &event_path(&id).unwrap().child("currentParticipants").unwrap(),
                &1,
            )
            .unwrap();
        cancel_registration(&fx.tree, &fx.blobs, &user("u1"), &id, &reg.id)
            .await
            .unwrap();

        assert_eq!(participants(&fx.tree, &id), 0);
        assert!(list_registrations(&fx.tree, &admin(), &id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_owner_or_admin_may_cancel() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);
        let reg = commit_registration(&fx.tree, &id, sample(&id, "u1", 2), today()).unwrap();

        let err = cancel_registration(&fx.tree, &fx.blobs, &user("u2"), &id, &reg.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
        assert_eq!(participants(&fx.tree, &id), 2);

        cancel_registration(&fx.tree, &fx.blobs, &admin(), &id, &reg.id)
            .await
            .unwrap();
        assert_eq!(participants(&fx.tree, &id), 0);
    }

    #[tokio::test]
    async fn users_list_only_their_own() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);
        commit_registration(&fx.tree, &id, sample(&id, "u1", 1), today()).unwrap();
        commit_registration(&fx.tree, &id, sample(&id, "u2", 1), today()).unwrap();

        let mine = list_registrations(&fx.tree, &user("u1"), &id).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].value.user_id, "u1");
        assert_eq!(list_registrations(&fx.tree, &admin(), &id).unwrap().len(), 2);
        assert!(matches!(
            list_registrations(&fx.tree, &admin(), "missing"),
            Err(AppError::NotFound)
        ));
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn check_in_window_bounds() {
        let (_tmp, tree) = crate::tree::tests::test_tree();
        let event = create_event(&tree, input("2030-05-10", "18:00", 10))
            .unwrap()
            .event
            .value;
        let window = Duration::minutes(30);

        assert!(!check_in_open(&event, at("2030-05-10", "17:29"), window));
        assert!(check_in_open(&event, at("2030-05-10", "17:30"), window));
        assert!(check_in_open(&event, at("2030-05-10", "18:00"), window));
        assert!(!check_in_open(&event, at("2030-05-10", "18:01"), window));
        assert!(!check_in_open(&event, at("2030-05-09", "17:45"), window));
    }

    #[test]
    fn check_in_window_stays_on_event_day() {
        let (_tmp, tree) = crate::tree::tests::test_tree();
        let event = create_event(&tree, input("2030-05-10", "00:10", 10))
            .unwrap()
            .event
            .value;
        let window = Duration::minutes(30);

        assert!(!check_in_open(&event, at("2030-05-09", "23:50"), window));
        assert!(check_in_open(&event, at("2030-05-10", "00:00"), window));
    }

    #[tokio::test]
    async fn attendance_confirm_and_undo() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);
        let reg = commit_registration(&fx.tree, &id, sample(&id, "u1", 1), today()).unwrap();

        let confirmed = confirm_attendance(
            &fx.tree,
            &fx.blobs,
            &user("u1"),
            &id,
            &reg.id,
            image("selfie.png"),
            at("2030-05-10", "17:45"),
            30,
        )
        .await
        .unwrap();
        assert!(confirmed.value.attended);
        assert!(confirmed.value.attended_at.is_some());
        let photo = confirmed.value.attendance_photo_ref.clone().unwrap();
        assert_eq!(
            photo,
            BlobKey::attendance_photo(&id, &reg.id, Some("png")).unwrap()
        );
        assert!(fx.blobs.get(&photo).await.unwrap().is_some());

        let undone = undo_attendance(&fx.tree, &fx.blobs, &user("u1"), &id, &reg.id)
            .await
            .unwrap();
        assert!(!undone.value.attended);
        assert!(undone.value.attended_at.is_none());
        assert!(undone.value.attendance_photo_ref.is_none());
        assert!(fx.blobs.get(&photo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attendance_outside_window_is_admin_only() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);
        let reg = commit_registration(&fx.tree, &id, sample(&id, "u1", 1), today()).unwrap();
        let early = at("2030-05-10", "09:00");

        let err = confirm_attendance(
            &fx.tree,
            &fx.blobs,
            &user("u1"),
            &id,
            &reg.id,
            image("selfie.png"),
            early,
            30,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = confirm_attendance(
            &fx.tree,
            &fx.blobs,
            &user("u2"),
            &id,
            &reg.id,
            image("selfie.png"),
            at("2030-05-10", "17:45"),
            30,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));

        let confirmed = confirm_attendance(
            &fx.tree,
            &fx.blobs,
            &admin(),
            &id,
            &reg.id,
            image("selfie.png"),
            early,
            30,
        )
        .await
        .unwrap();
        assert!(confirmed.value.attended);
    }

    #[tokio::test]
    async fn retaken_photo_replaces_the_old_one() {
        let fx = fixture();
        let id = event_with(&fx.tree, 10, 0);
        let reg = commit_registration(&fx.tree, &id, sample(&id, "u1", 1), today()).unwrap();
        let now = at("2030-05-10", "17:45");

        let first = confirm_attendance(
            &fx.tree,
            &fx.blobs,
            &user("u1"),
            &id,
            &reg.id,
            image("selfie.png"),
            now,
            30,
        )
        .await
        .unwrap();
        let first_photo = first.value.attendance_photo_ref.unwrap();

        let jpeg = Upload {
            file_name: "camera".into(),
            content_type: Some("image/jpeg".into()),
            data: bytes::Bytes::from_static(b"\xff\xd8 fake"),
        };
        let second = confirm_attendance(&fx.tree, &fx.blobs, &user("u1"), &id, &reg.id, jpeg, now, 30)
            .await
            .unwrap();
        let second_photo = second.value.attendance_photo_ref.unwrap();

        assert!(second_photo.as_str().ends_with(".jpg"));
        assert_eq!(BlobStore::content_type(&second_photo), "image/jpeg");
        assert!(fx.blobs.get(&second_photo).await.unwrap().is_some());
        assert!(fx.blobs.get(&first_photo).await.unwrap().is_none());
    }
}
