use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{key_of, node, now_millis, post_path, required, with_uploaded, BLOG_POSTS};
use crate::db::models::{Keyed, Post};
use crate::error::{AppError, AppResult};
use crate::storage::{BlobKey, BlobStore, Upload};
use crate::tree::DataTree;

/// Fields of a post as submitted by an admin.
#[derive(Debug, Default)]
pub struct PostInput {
    pub title: String,
    pub content: String,
    pub image: Option<Upload>,
}

/// Every post, newest first.
pub fn list_posts(tree: &DataTree) -> AppResult<Vec<Keyed<Post>>> {
    let mut posts: Vec<Keyed<Post>> = tree.children_as(&node(&[BLOG_POSTS])?)?;
    posts.sort_by(|a, b| b.value.created_at.cmp(&a.value.created_at));
    Ok(posts)
}

pub fn get_post(tree: &DataTree, id: &str) -> AppResult<Keyed<Post>> {
    let post: Post = tree.get_as(&post_path(id)?)?.ok_or(AppError::NotFound)?;
    Ok(Keyed {
        id: id.to_string(),
        value: post,
    })
}

pub async fn create_post(
    tree: &DataTree,
    blobs: &BlobStore,
    input: PostInput,
) -> AppResult<Keyed<Post>> {
    let title = required("Title", &input.title)?;
    let content = required("Content", &input.content)?;
    let upload = image_upload(input.image.as_ref())?;

    let post = with_uploaded(blobs, upload, |image_ref| {
        let post = Post {
            title,
            content,
            image_ref: image_ref.cloned(),
            created_at: Utc::now(),
            updated_at: None,
        };
        let path = tree.push(&node(&[BLOG_POSTS])?, &post)?;
        Ok(Keyed {
            id: key_of(&path),
            value: post,
        })
    })
    .await?;

    tracing::info!(post = %post.id, "Post created");
    Ok(post)
}

/// Rewrite a post. A new image replaces the old one, which is then deleted;
/// without one the existing image is kept.
pub async fn update_post(
    tree: &DataTree,
    blobs: &BlobStore,
    id: &str,
    input: PostInput,
) -> AppResult<Keyed<Post>> {
    let path = post_path(id)?;
    let title = required("Title", &input.title)?;
    let content = required("Content", &input.content)?;
    if tree.get(&path)?.is_none() {
        return Err(AppError::NotFound);
    }
    let upload = image_upload(input.image.as_ref())?;

    let (previous, post) = with_uploaded(blobs, upload, |image_ref| {
        tree.transaction(|txn| -> AppResult<_> {
            let previous: Post = txn.get_as(&path)?.ok_or(AppError::NotFound)?;

            let mut fields = Map::new();
            fields.insert("title".into(), Value::String(title));
            fields.insert("content".into(), Value::String(content));
            fields.insert("updatedAt".into(), json!(Utc::now()));
            if let Some(key) = image_ref {
                fields.insert("imageRef".into(), json!(key));
            }
            txn.update(&path, fields)?;

            let post: Post = txn.get_as(&path)?.ok_or(AppError::NotFound)?;
            Ok((previous, post))
        })
    })
    .await?;

    if let Some(old) = &previous.image_ref {
        if post.image_ref.as_ref() != Some(old) {
            blobs.discard(old).await;
        }
    }

    tracing::info!(post = %id, "Post updated");
    Ok(Keyed {
        id: id.to_string(),
        value: post,
    })
}

/// Remove a post, then its image.
pub async fn delete_post(tree: &DataTree, blobs: &BlobStore, id: &str) -> AppResult<()> {
    let path = post_path(id)?;
    let post = tree.transaction(|txn| -> AppResult<Post> {
        let post: Post = txn.get_as(&path)?.ok_or(AppError::NotFound)?;
        txn.remove(&path)?;
        Ok(post)
    })?;

    if let Some(key) = &post.image_ref {
        blobs.discard(key).await;
    }
    tracing::info!(post = %id, "Post deleted");
    Ok(())
}

fn image_upload(image: Option<&Upload>) -> AppResult<Option<(BlobKey, &Upload)>> {
    match image {
        Some(upload) => Ok(Some((
            BlobKey::blog_image(now_millis(), &upload.file_name)?,
            upload,
        ))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::tests::{fixture, image};
    use chrono::Duration;

    fn input(title: &str, content: &str, image: Option<Upload>) -> PostInput {
        PostInput {
            title: title.into(),
            content: content.into(),
            image,
        }
    }

    #[tokio::test]
    async fn create_requires_title_and_content() {
        let fx = fixture();
        let err = create_post(&fx.tree, &fx.blobs, input(" ", "body", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = create_post(&fx.tree, &fx.blobs, input("Title", "", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(list_posts(&fx.tree).unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_stores_image_and_record() {
        let fx = fixture();
        let post = create_post(
            &fx.tree,
            &fx.blobs,
            input("Hello", "World", Some(image("cover.png"))),
        )
        .await
        .unwrap();

        let key = post.value.image_ref.clone().unwrap();
        assert!(key.as_str().starts_with("blog-images/"));
        assert!(key.as_str().ends_with("-cover.png"));
        assert!(fx.blobs.get(&key).await.unwrap().is_some());

        let stored = get_post(&fx.tree, &post.id).unwrap();
        assert_eq!(stored.value.title, "Hello");
        assert_eq!(stored.value.image_ref, Some(key));
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let fx = fixture();
        let older = Post {
            title: "Old".into(),
            content: "x".into(),
            image_ref: None,
            created_at: Utc::now() - Duration::days(1),
            updated_at: None,
        };
        fx.tree.set(&post_path("old").unwrap(), &older).unwrap();
        create_post(&fx.tree, &fx.blobs, input("New", "y", None))
            .await
            .unwrap();

        let titles: Vec<String> = list_posts(&fx.tree)
            .unwrap()
            .into_iter()
            .map(|p| p.value.title)
            .collect();
        assert_eq!(titles, vec!["New", "Old"]);
    }

    #[tokio::test]
    async fn update_replaces_image_and_deletes_old_one() {
        let fx = fixture();
        let post = create_post(&fx.tree, &fx.blobs, input("A", "a", Some(image("one.png"))))
            .await
            .unwrap();
        let old_key = post.value.image_ref.clone().unwrap();

        // Keys carry a millisecond stamp
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = update_post(
            &fx.tree,
            &fx.blobs,
            &post.id,
            input("B", "b", Some(image("two.png"))),
        )
        .await
        .unwrap();

        let new_key = updated.value.image_ref.clone().unwrap();
        assert_ne!(new_key, old_key);
        assert_eq!(updated.value.title, "B");
        assert!(updated.value.updated_at.is_some());
        assert!(fx.blobs.get(&old_key).await.unwrap().is_none());
        assert!(fx.blobs.get(&new_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_without_image_keeps_existing() {
        let fx = fixture();
        let post = create_post(&fx.tree, &fx.blobs, input("A", "a", Some(image("one.png"))))
            .await
            .unwrap();
        let key = post.value.image_ref.clone().unwrap();

        let updated = update_post(&fx.tree, &fx.blobs, &post.id, input("B", "b", None))
            .await
            .unwrap();
        assert_eq!(updated.value.image_ref, Some(key.clone()));
        assert!(fx.blobs.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_missing_post_is_not_found() {
        let fx = fixture();
        let err = update_post(&fx.tree, &fx.blobs, "nope", input("A", "a", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn delete_removes_record_and_image() {
        let fx = fixture();
        let post = create_post(&fx.tree, &fx.blobs, input("A", "a", Some(image("one.png"))))
            .await
            .unwrap();
        let key = post.value.image_ref.clone().unwrap();

        delete_post(&fx.tree, &fx.blobs, &post.id).await.unwrap();

        assert!(matches!(get_post(&fx.tree, &post.id), Err(AppError::NotFound)));
        assert!(fx.blobs.get(&key).await.unwrap().is_none());
        assert!(matches!(
            delete_post(&fx.tree, &fx.blobs, &post.id).await,
            Err(AppError::NotFound)
        ));
    }
}
