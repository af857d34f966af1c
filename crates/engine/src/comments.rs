//! Threaded task comments with `@username` mentions.

use std::collections::HashSet;

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{Comment, NotificationType, Project, ProjectStatus, Task, User};

use crate::notifications::{NewNotification, NotificationService, excerpt};
use crate::projects::ProjectService;
use crate::query::{contains_pattern, order_by};
use crate::tasks::TaskService;

pub const MAX_CONTENT_CHARS: usize = 1000;

/// Deepest allowed thread level, counting the top-level comment as 1.
pub const MAX_DEPTH: usize = 3;

const EXCERPT_CHARS: usize = 50;

const ORDERING: &[(&str, &str)] = &[("created_at", "c.created_at"), ("updated_at", "c.updated_at")];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentFilters {
    pub task_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub search: Option<String>,
    pub ordering: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateComment {
    pub task: Uuid,
    pub content: String,
    pub parent: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateComment {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommentRow {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub comment: Comment,
    pub author_username: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Named {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MentionedUser {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommentDetail {
    #[serde(flatten)]
    pub comment: Comment,
    pub author_username: String,
    pub task: Named,
    pub project: Named,
    pub mentioned_users: Vec<MentionedUser>,
}

/// Usernames mentioned as `@name`, in order of first appearance.
pub fn parse_mentions(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('@'))
        .map(|name| name.trim_end_matches(|c: char| ",;:!?.)".contains(c)))
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

fn check_content(content: &str) -> Result<(), AppError> {
    if content.trim().is_empty() {
        return Err(AppError::Validation("Content is required.".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::Validation(
            "Content must not exceed 1000 characters.".to_string(),
        ));
    }
    Ok(())
}

/// Comments are only allowed while the project is active.
pub fn check_project_open(status: ProjectStatus) -> Result<(), AppError> {
    match status {
        ProjectStatus::Completed => Err(AppError::Forbidden(
            "Cannot add comments to a completed project".to_string(),
        )),
        ProjectStatus::NotStarted | ProjectStatus::OnHold => Err(AppError::Forbidden(format!(
            "Cannot add comments when project is {}",
            status
        ))),
        _ => Ok(()),
    }
}

fn comment_url(comment_id: Uuid) -> String {
    format!("/api/v1/tasks/comments/{}/", comment_id)
}

pub struct CommentService;

impl CommentService {
    pub async fn get(pool: &PgPool, comment_id: Uuid) -> Result<Comment, AppError> {
        let comment: Comment = sqlx::query_as("SELECT * FROM comments WHERE id = $1")
            .bind(comment_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Comment not found".to_string()))?;
        Ok(comment)
    }

    pub async fn list(
        pool: &PgPool,
        user_id: Uuid,
        filters: &CommentFilters,
        page: &PageParams,
    ) -> Result<Paginated<CommentRow>, AppError> {
        if let Some(task_id) = filters.task_id {
            let task = TaskService::get(pool, task_id).await?;
            let project = ProjectService::get(pool, task.project_id).await?;
            if project.owner_id != user_id && !TaskService::is_assignee(pool, task_id, user_id).await? {
                return Err(AppError::Forbidden("You are not assigned to this task.".to_string()));
            }
        } else if let Some(project_id) = filters.project_id {
            let project = ProjectService::get(pool, project_id).await?;
            if project.owner_id != user_id && !ProjectService::is_member(pool, project_id, user_id).await? {
                return Err(AppError::Forbidden(
                    "You are not a member of this project or the owner.".to_string(),
                ));
            }
        }

        let build = |select: &str| {
            let mut qb = QueryBuilder::<Postgres>::new(select);
            qb.push(" FROM comments c JOIN users u ON u.id = c.author_id JOIN tasks t ON t.id = c.task_id WHERE ");
            if let Some(task_id) = filters.task_id {
                qb.push("c.task_id = ").push_bind(task_id);
            } else if let Some(project_id) = filters.project_id {
                qb.push("t.project_id = ").push_bind(project_id);
            } else {
                qb.push("(c.author_id = ")
                    .push_bind(user_id)
                    .push(" OR EXISTS (SELECT 1 FROM task_assignments a WHERE a.task_id = c.task_id AND a.user_id = ")
                    .push_bind(user_id)
                    .push(") OR EXISTS (SELECT 1 FROM projects p WHERE p.id = t.project_id AND p.owner_id = ")
                    .push_bind(user_id)
                    .push("))");
            }
            match filters.parent_id {
                Some(parent) => {
                    qb.push(" AND c.parent_id = ").push_bind(parent);
                }
                None => {
                    qb.push(" AND c.parent_id IS NULL");
                }
            }
            if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
                let pattern = contains_pattern(search.trim());
                qb.push(" AND (c.content ILIKE ")
                    .push_bind(pattern.clone())
                    .push(" OR u.username ILIKE ")
                    .push_bind(pattern)
                    .push(")");
            }
            qb
        };

        let total: i64 = build("SELECT COUNT(*)").build_query_scalar().fetch_one(pool).await?;

        let mut select = build("SELECT c.*, u.username AS author_username");
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-created_at"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let rows: Vec<CommentRow> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(rows, total, page))
    }

    pub async fn create(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        author: &User,
        params: &CreateComment,
    ) -> Result<CommentDetail, AppError> {
        let task = TaskService::get(pool, params.task).await?;
        let project = ProjectService::get(pool, task.project_id).await?;
        check_project_open(project.status)?;

        if !TaskService::is_assignee(pool, task.id, author.id).await? {
            return Err(AppError::Validation("You are not assigned to this task.".to_string()));
        }
        check_content(&params.content)?;

        let parent = match params.parent {
            Some(parent_id) => {
                let parent = Self::get(pool, parent_id).await?;
                if parent.task_id != task.id {
                    return Err(AppError::Validation(
                        "The parent comment must belong to the same task.".to_string(),
                    ));
                }
                if Self::depth(pool, parent_id).await? >= MAX_DEPTH {
                    return Err(AppError::Validation(format!(
                        "Cannot nest comments more than {} levels deep.",
                        MAX_DEPTH
                    )));
                }
                Some(parent)
            }
            None => None,
        };

        let comment: Comment = sqlx::query_as(
            r#"
            INSERT INTO comments (id, task_id, author_id, content, parent_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task.id)
        .bind(author.id)
        .bind(&params.content)
        .bind(params.parent)
        .fetch_one(pool)
        .await?;

        if let Some(parent) = &parent {
            sqlx::query("UPDATE comments SET reply_count = reply_count + 1 WHERE id = $1")
                .bind(parent.id)
                .execute(pool)
                .await?;
        }

        let mentioned = Self::set_mentions(pool, comment.id, &comment.content).await?;

        let snippet = excerpt(&comment.content, EXCERPT_CHARS);
        let base = |title: &str, body: String, kind: NotificationType| {
            NewNotification::new(author.id, kind, title, body)
                .from_sender(author.id)
                .with_url(comment_url(comment.id))
                .about("comment", comment.id)
        };

        let mention = base(
            "You were mentioned in a comment",
            format!("{} mentioned you in a comment: '{}'", author.username, snippet),
            NotificationType::CommentMention,
        );
        NotificationService::notify_all(pool, redis, &mentioned, &mention).await;

        if let Some(parent) = parent.as_ref().filter(|p| p.author_id != author.id) {
            let reply = base(
                "New Reply to Your Comment",
                format!("{} replied to your comment: '{}'", author.username, snippet),
                NotificationType::CommentReply,
            );
            NotificationService::notify(pool, redis, reply.to(parent.author_id)).await;
        }

        let others: Vec<Uuid> = TaskService::assignee_ids(pool, task.id)
            .await?
            .into_iter()
            .filter(|id| *id != author.id)
            .collect();
        let on_task = base(
            "New Comment on Task",
            format!(
                "{} commented on task '{}': '{}'",
                author.username, task.name, snippet
            ),
            NotificationType::TaskComment,
        );
        NotificationService::notify_all(pool, redis, &others, &on_task).await;

        tracing::info!(comment_id = %comment.id, task_id = %task.id, mentions = mentioned.len(), "Comment created");
        Self::assemble(pool, comment, &task, &project).await
    }

    pub async fn detail(pool: &PgPool, user_id: Uuid, comment_id: Uuid) -> Result<CommentDetail, AppError> {
        let comment = Self::get(pool, comment_id).await?;
        let task = TaskService::get(pool, comment.task_id).await?;
        let project = ProjectService::get(pool, task.project_id).await?;
        if comment.author_id != user_id && !Self::can_view(pool, &task, &project, user_id).await? {
            return Err(AppError::NotFound("Comment not found".to_string()));
        }
        Self::assemble(pool, comment, &task, &project).await
    }

    pub async fn update(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        author: &User,
        comment_id: Uuid,
        params: &UpdateComment,
    ) -> Result<CommentDetail, AppError> {
        let comment = Self::get(pool, comment_id).await?;
        if comment.author_id != author.id {
            return Err(AppError::Forbidden(
                "You do not have permission to edit this comment.".to_string(),
            ));
        }
        let task = TaskService::get(pool, comment.task_id).await?;
        let project = ProjectService::get(pool, task.project_id).await?;
        check_project_open(project.status)?;
        check_content(&params.content)?;

        let before: HashSet<Uuid> = Self::mentioned_ids(pool, comment_id).await?.into_iter().collect();

        let comment: Comment = sqlx::query_as(
            "UPDATE comments SET content = $1, updated_at = now() WHERE id = $2 RETURNING *",
        )
        .bind(&params.content)
        .bind(comment_id)
        .fetch_one(pool)
        .await?;

        let after = Self::set_mentions(pool, comment_id, &comment.content).await?;
        let fresh: Vec<Uuid> = after.into_iter().filter(|id| !before.contains(id)).collect();

        let template = NewNotification::new(
            author.id,
            NotificationType::CommentMention,
            "You were mentioned in a comment",
            format!(
                "{} mentioned you in an updated comment: '{}'",
                author.username,
                excerpt(&comment.content, EXCERPT_CHARS)
            ),
        )
        .from_sender(author.id)
        .with_url(comment_url(comment_id))
        .about("comment", comment_id);
        NotificationService::notify_all(pool, redis, &fresh, &template).await;

        let comment = Self::get(pool, comment_id).await?;
        Self::assemble(pool, comment, &task, &project).await
    }

    pub async fn delete(pool: &PgPool, user_id: Uuid, comment_id: Uuid) -> Result<(), AppError> {
        let comment = Self::get(pool, comment_id).await?;
        if comment.author_id != user_id {
            return Err(AppError::Forbidden(
                "You do not have permission to delete this comment.".to_string(),
            ));
        }
        Self::remove(pool, &comment).await?;
        tracing::info!(comment_id = %comment_id, "Comment deleted");
        Ok(())
    }

    /// Delete a comment and keep its parent's reply count in step.
    pub async fn remove(pool: &PgPool, comment: &Comment) -> Result<(), AppError> {
        if let Some(parent_id) = comment.parent_id {
            sqlx::query("UPDATE comments SET reply_count = GREATEST(reply_count - 1, 0) WHERE id = $1")
                .bind(parent_id)
                .execute(pool)
                .await?;
        }
        sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(comment.id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn replies(
        pool: &PgPool,
        user_id: Uuid,
        comment_id: Uuid,
        page: &PageParams,
    ) -> Result<Paginated<CommentRow>, AppError> {
        let parent = Self::get(pool, comment_id).await?;
        let task = TaskService::get(pool, parent.task_id).await?;
        let project = ProjectService::get(pool, task.project_id).await?;
        if parent.author_id != user_id && !Self::can_view(pool, &task, &project, user_id).await? {
            return Err(AppError::NotFound("Comment not found".to_string()));
        }

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM comments WHERE parent_id = $1")
            .bind(comment_id)
            .fetch_one(pool)
            .await?;
        let rows: Vec<CommentRow> = sqlx::query_as(
            r#"
            SELECT c.*, u.username AS author_username
            FROM comments c JOIN users u ON u.id = c.author_id
            WHERE c.parent_id = $1
            ORDER BY c.created_at
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(comment_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Paginated::new(rows, total, page))
    }

    /// Thread level of a comment: 1 for top level, 2 for a reply, and so on.
    async fn depth(pool: &PgPool, comment_id: Uuid) -> Result<usize, AppError> {
        let (depth,): (i64,) = sqlx::query_as(
            r#"
            WITH RECURSIVE chain AS (
                SELECT id, parent_id FROM comments WHERE id = $1
                UNION ALL
                SELECT c.id, c.parent_id FROM comments c JOIN chain ON c.id = chain.parent_id
            )
            SELECT COUNT(*) FROM chain
            "#,
        )
        .bind(comment_id)
        .fetch_one(pool)
        .await?;
        Ok(depth as usize)
    }

    async fn can_view(pool: &PgPool, task: &Task, project: &Project, user_id: Uuid) -> Result<bool, AppError> {
        Ok(project.owner_id == user_id
            || TaskService::is_assignee(pool, task.id, user_id).await?
            || ProjectService::is_member(pool, project.id, user_id).await?)
    }

    /// Replace a comment's mentions with those in `content`. Returns the mentioned user ids.
    async fn set_mentions(pool: &PgPool, comment_id: Uuid, content: &str) -> Result<Vec<Uuid>, AppError> {
        let usernames = parse_mentions(content);
        let users: Vec<(Uuid,)> = if usernames.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as("SELECT id FROM users WHERE username = ANY($1)")
                .bind(&usernames)
                .fetch_all(pool)
                .await?
        };
        let ids: Vec<Uuid> = users.into_iter().map(|(id,)| id).collect();

        sqlx::query("DELETE FROM comment_mentions WHERE comment_id = $1")
            .bind(comment_id)
            .execute(pool)
            .await?;
        if !ids.is_empty() {
            sqlx::query(
                "INSERT INTO comment_mentions (comment_id, user_id) SELECT $1, u FROM UNNEST($2::uuid[]) AS u",
            )
            .bind(comment_id)
            .bind(&ids)
            .execute(pool)
            .await?;
        }
        sqlx::query("UPDATE comments SET mention_count = $1 WHERE id = $2")
            .bind(ids.len() as i32)
            .bind(comment_id)
            .execute(pool)
            .await?;

        Ok(ids)
    }

    async fn mentioned_ids(pool: &PgPool, comment_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as("SELECT user_id FROM comment_mentions WHERE comment_id = $1")
            .bind(comment_id)
            .fetch_all(pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn assemble(
        pool: &PgPool,
        comment: Comment,
        task: &Task,
        project: &Project,
    ) -> Result<CommentDetail, AppError> {
        let comment = Self::get(pool, comment.id).await?;
        let (author_username,): (String,) = sqlx::query_as("SELECT username FROM users WHERE id = $1")
            .bind(comment.author_id)
            .fetch_one(pool)
            .await?;
        let mentioned_users: Vec<MentionedUser> = sqlx::query_as(
            r#"
            SELECT u.id, u.username FROM comment_mentions m JOIN users u ON u.id = m.user_id
            WHERE m.comment_id = $1 ORDER BY u.username
            "#,
        )
        .bind(comment.id)
        .fetch_all(pool)
        .await?;

        Ok(CommentDetail {
            comment,
            author_username,
            task: Named {
                id: task.id,
                name: task.name.clone(),
            },
            project: Named {
                id: project.id,
                name: project.name.clone(),
            },
            mentioned_users,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mentions() {
        let names = parse_mentions("Thanks @ada, can @bob.smith review? cc @ada @");
        assert_eq!(names, vec!["ada".to_string(), "bob.smith".to_string()]);
    }

    #[test]
    fn test_mentions_need_leading_at() {
        assert!(parse_mentions("mail me at ada@example.com").is_empty());
    }

    #[test]
    fn test_content_limits() {
        assert!(check_content("ok").is_ok());
        assert!(check_content("   ").is_err());
        assert!(check_content(&"x".repeat(1000)).is_ok());
        assert!(check_content(&"x".repeat(1001)).is_err());
    }

    #[test]
    fn test_comments_blocked_on_inactive_projects() {
        assert!(check_project_open(ProjectStatus::InProgress).is_ok());
        assert!(check_project_open(ProjectStatus::Overdue).is_ok());
        let err = check_project_open(ProjectStatus::Completed).unwrap_err();
        assert_eq!(err.public_message(), "Cannot add comments to a completed project");
        assert!(check_project_open(ProjectStatus::OnHold).is_err());
        assert!(check_project_open(ProjectStatus::NotStarted).is_err());
    }
}
