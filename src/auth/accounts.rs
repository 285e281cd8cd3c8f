use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::config::AuthConfig;
use crate::db::models::{Role, UserProfile};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::tree::{DataPath, DataTree, TreeError, TreeTxn};

pub const MIN_PASSWORD_LEN: usize = 6;
pub const USERS: &str = "users";

pub fn user_path(uid: &str) -> Result<DataPath, TreeError> {
    Ok(DataPath::root().child(USERS)?.child(uid)?)
}

/// Lowercase, trim, and sanity-check an email address.
pub fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(AppError::BadRequest("A valid email address is required".into()))
    }
}

pub fn sign_up(
    tree: &DataTree,
    auth: &AuthConfig,
    email: &str,
    password: &str,
) -> AppResult<CurrentUser> {
    let email = normalize_email(email)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let hash = bcrypt::hash(password, auth.bcrypt_cost)
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?;
    let role = role_for(auth, &email);

    let uid = tree.transaction(|txn| -> AppResult<String> {
        if account_by_email(txn, &email)?.is_some() {
            return Err(AppError::Conflict(
                "An account with this email already exists".into(),
            ));
        }
        insert_account(txn, &email, Some(&hash), role)
    })?;

    Ok(CurrentUser { uid, email, role })
}

pub fn log_in(tree: &DataTree, email: &str, password: &str) -> AppResult<CurrentUser> {
    let email = email.trim().to_lowercase();
    let row: Option<(String, Option<String>)> = {
        let conn = tree.pool().get()?;
        conn.query_row(
            "SELECT uid, password_hash FROM accounts WHERE email = ?1",
            params![email],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
    };

    // Federated-only accounts have no password and cannot log in this way
    let Some((uid, Some(hash))) = row else {
        return Err(AppError::Unauthorized);
    };
    if !bcrypt::verify(password, &hash).unwrap_or(false) {
        tracing::info!(uid = %uid, "Rejected password login");
        return Err(AppError::Unauthorized);
    }

    load_identity(tree, &uid)?.ok_or(AppError::Unauthorized)
}

/// Log in an identity vouched for by a trusted upstream provider. The first
/// login links to the account with the same email, creating one if needed.
pub fn federated_log_in(
    tree: &DataTree,
    auth: &AuthConfig,
    provider: &str,
    subject: &str,
    email: &str,
) -> AppResult<CurrentUser> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(AppError::BadRequest("Subject is required".into()));
    }
    let email = normalize_email(email)?;
    let role = role_for(auth, &email);

    let uid = tree.transaction(|txn| -> AppResult<String> {
        let linked: Option<String> = txn
            .connection()
            .query_row(
                "SELECT uid FROM federated_identities WHERE provider = ?1 AND subject = ?2",
                params![provider, subject],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(uid) = linked {
            return Ok(uid);
        }

        let uid = match account_by_email(txn, &email)? {
            Some(uid) => uid,
            None => insert_account(txn, &email, None, role)?,
        };
        txn.connection().execute(
            "INSERT INTO federated_identities (provider, subject, uid) VALUES (?1, ?2, ?3)",
            params![provider, subject, uid],
        )?;
        tracing::info!(uid = %uid, provider, "Linked federated identity");
        Ok(uid)
    })?;

    load_identity(tree, &uid)?.ok_or(AppError::Unauthorized)
}

/// Identity and role for an account, read from `users/{uid}`.
pub fn load_identity(tree: &DataTree, uid: &str) -> AppResult<Option<CurrentUser>> {
    let profile: Option<UserProfile> = tree.get_as(&user_path(uid)?)?;
    Ok(profile.map(|p| CurrentUser {
        uid: uid.to_string(),
        email: p.email,
        role: p.role,
    }))
}

/// Compare secrets without leaking where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len_match = a.len() == b.len();
    let max_len = a.len().max(b.len());

    let mut result = 0u8;
    for i in 0..max_len {
        let byte_a = a.get(i).copied().unwrap_or(0);
        let byte_b = b.get(i).copied().unwrap_or(0);
        result |= byte_a ^ byte_b;
    }

    len_match && result == 0
}

pub fn verify_federation_secret(
    auth: &AuthConfig,
    provider: &str,
    presented: Option<&str>,
) -> AppResult<()> {
    let expected = auth.federated.get(provider).ok_or_else(|| {
        AppError::BadRequest(format!("Unknown identity provider: {}", provider))
    })?;
    match presented {
        Some(secret) if constant_time_eq(secret.as_bytes(), expected.secret.as_bytes()) => Ok(()),
        _ => {
            tracing::warn!(provider, "Rejected federated login with bad secret");
            Err(AppError::Unauthorized)
        }
    }
}

fn role_for(auth: &AuthConfig, email: &str) -> Role {
    if auth.is_admin_email(email) {
        Role::Admin
    } else {
        Role::User
    }
}

fn account_by_email(txn: &TreeTxn<'_>, email: &str) -> AppResult<Option<String>> {
    Ok(txn
        .connection()
        .query_row(
            "SELECT uid FROM accounts WHERE email = ?1",
            params![email],
            |row| row.get(0),
        )
        .optional()?)
}

fn insert_account(
    txn: &mut TreeTxn<'_>,
    email: &str,
    password_hash: Option<&str>,
    role: Role,
) -> AppResult<String> {
    let uid = uuid::Uuid::now_v7().to_string();
    txn.connection().execute(
        "INSERT INTO accounts (uid, email, password_hash) VALUES (?1, ?2, ?3)",
        params![uid, email, password_hash],
    )?;
    let profile = UserProfile {
        email: email.to_string(),
        role,
        created_at: Utc::now(),
    };
    txn.set(&user_path(&uid)?, &profile)?;

    tracing::info!(uid = %uid, ?role, "Account created");
    Ok(uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederatedProviderConfig;
    use crate::tree::tests::test_tree;

    fn auth_config() -> AuthConfig {
        let mut auth = AuthConfig {
            bcrypt_cost: 4,
            admin_emails: vec!["admin@example.com".into()],
            ..AuthConfig::default()
        };
        auth.federated.insert(
            "google".into(),
            FederatedProviderConfig {
                secret: "shh".into(),
            },
        );
        auth
    }

    #[test]
    fn normalize_email_lowercases_and_validates() {
        assert_eq!(normalize_email("  Ann@Example.COM ").unwrap(), "ann@example.com");
        assert!(normalize_email("ann").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("ann@localhost").is_err());
        assert!(normalize_email("a nn@example.com").is_err());
    }

    #[test]
    fn sign_up_writes_profile_with_role() {
        let (_tmp, tree) = test_tree();
        let auth = auth_config();

        let user = sign_up(&tree, &auth, "Ann@example.com", "hunter22").unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(user.email, "ann@example.com");

        let profile: UserProfile = tree.get_as(&user_path(&user.uid).unwrap()).unwrap().unwrap();
        assert_eq!(profile.email, "ann@example.com");
        assert_eq!(profile.role, Role::User);

        let admin = sign_up(&tree, &auth, "admin@example.com", "hunter22").unwrap();
        assert_eq!(admin.role, Role::Admin);
    }

    #[test]
    fn sign_up_rejects_duplicates_and_short_passwords() {
        let (_tmp, tree) = test_tree();
        let auth = auth_config();

        sign_up(&tree, &auth, "ann@example.com", "hunter22").unwrap();
        let dup = sign_up(&tree, &auth, "ANN@example.com", "hunter22").unwrap_err();
        assert!(matches!(dup, AppError::Conflict(_)));

        let short = sign_up(&tree, &auth, "bob@example.com", "abc").unwrap_err();
        assert!(matches!(short, AppError::BadRequest(_)));
    }

    #[test]
    fn log_in_checks_password() {
        let (_tmp, tree) = test_tree();
        let auth = auth_config();
        let created = sign_up(&tree, &auth, "ann@example.com", "hunter22").unwrap();

        let user = log_in(&tree, " ANN@example.com", "hunter22").unwrap();
        assert_eq!(user.uid, created.uid);

        assert!(matches!(
            log_in(&tree, "ann@example.com", "wrong").unwrap_err(),
            AppError::Unauthorized
        ));
        assert!(matches!(
            log_in(&tree, "nobody@example.com", "hunter22").unwrap_err(),
            AppError::Unauthorized
        ));
    }

    #[test]
    fn federated_login_links_existing_account_once() {
        let (_tmp, tree) = test_tree();
        let auth = auth_config();
        let created = sign_up(&tree, &auth, "ann@example.com", "hunter22").unwrap();

        let first = federated_log_in(&tree, &auth, "google", "g-123", "ann@example.com").unwrap();
        assert_eq!(first.uid, created.uid);

        // Later logins follow the link even if the upstream email changed
        let again = federated_log_in(&tree, &auth, "google", "g-123", "new@example.com").unwrap();
        assert_eq!(again.uid, created.uid);
    }

    #[test]
    fn federated_login_creates_passwordless_account() {
        let (_tmp, tree) = test_tree();
        let auth = auth_config();

        let user = federated_log_in(&tree, &auth, "google", "g-9", "zed@example.com").unwrap();
        assert_eq!(user.role, Role::User);
        assert!(load_identity(&tree, &user.uid).unwrap().is_some());

        assert!(matches!(
            log_in(&tree, "zed@example.com", "").unwrap_err(),
            AppError::Unauthorized
        ));
    }

    #[test]
    fn federation_secret_checked() {
        let auth = auth_config();
        assert!(verify_federation_secret(&auth, "google", Some("shh")).is_ok());
        assert!(matches!(
            verify_federation_secret(&auth, "google", Some("nope")),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            verify_federation_secret(&auth, "google", None),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            verify_federation_secret(&auth, "github", Some("shh")),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn constant_time_eq_matches_only_equal_inputs() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
