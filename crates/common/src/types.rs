use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account role. Admins get access to the `/api/v1/admins` surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::User => write!(f, "user"),
        }
    }
}

/// What an emailed one-time password is meant to confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtpPurpose {
    Registration,
    EmailChange,
    PasswordReset,
}

impl OtpPurpose {
    /// Lowercase words used in user-facing messages ("password reset").
    pub fn describe(&self) -> &'static str {
        match self {
            OtpPurpose::Registration => "registration",
            OtpPurpose::EmailChange => "email change",
            OtpPurpose::PasswordReset => "password reset",
        }
    }
}

impl std::fmt::Display for OtpPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtpPurpose::Registration => write!(f, "REGISTRATION"),
            OtpPurpose::EmailChange => write!(f, "EMAIL_CHANGE"),
            OtpPurpose::PasswordReset => write!(f, "PASSWORD_RESET"),
        }
    }
}

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    OnHold,
    Overdue,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 5] = [
        ProjectStatus::NotStarted,
        ProjectStatus::InProgress,
        ProjectStatus::Completed,
        ProjectStatus::OnHold,
        ProjectStatus::Overdue,
    ];

    /// Tasks may only be created while work is underway.
    pub fn can_create_task(&self) -> bool {
        matches!(self, ProjectStatus::InProgress | ProjectStatus::Overdue)
    }

    /// Completed projects are frozen.
    pub fn is_read_only(&self) -> bool {
        matches!(self, ProjectStatus::Completed)
    }

    /// Task edits, comments and status changes are blocked outside active states.
    pub fn can_perform_activity(&self) -> bool {
        !matches!(
            self,
            ProjectStatus::NotStarted | ProjectStatus::OnHold | ProjectStatus::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::NotStarted => "not_started",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Completed => "completed",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Overdue => "overdue",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid status '{}'", s))
    }
}

/// A member's role inside a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum MembershipRole {
    Owner,
    Member,
}

impl std::fmt::Display for MembershipRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipRole::Owner => write!(f, "owner"),
            MembershipRole::Member => write!(f, "member"),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Overdue,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::NotStarted => write!(f, "not_started"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Overdue => write!(f, "overdue"),
        }
    }
}

/// Approval state of a status-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Approved => write!(f, "approved"),
            RequestStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Kind of in-app notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationType {
    Account,
    Project,
    Task,
    Comment,
    Subscription,
    CommentMention,
    CommentReply,
    TaskComment,
    AdminNotification,
}

impl NotificationType {
    /// The preference key that gates this type, or `None` when it is always delivered.
    pub fn preference_key(&self) -> Option<&'static str> {
        match self {
            NotificationType::Account => Some("account"),
            NotificationType::Project => Some("project"),
            NotificationType::Task => Some("task"),
            NotificationType::Comment
            | NotificationType::CommentMention
            | NotificationType::CommentReply
            | NotificationType::TaskComment => Some("comment"),
            NotificationType::Subscription => Some("subscription"),
            NotificationType::AdminNotification => None,
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Account => write!(f, "account"),
            NotificationType::Project => write!(f, "project"),
            NotificationType::Task => write!(f, "task"),
            NotificationType::Comment => write!(f, "comment"),
            NotificationType::Subscription => write!(f, "subscription"),
            NotificationType::CommentMention => write!(f, "comment_mention"),
            NotificationType::CommentReply => write!(f, "comment_reply"),
            NotificationType::TaskComment => write!(f, "task_comment"),
            NotificationType::AdminNotification => write!(f, "admin_notification"),
        }
    }
}

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Subscription plan tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum PlanName {
    Basic,
    Pro,
    Enterprise,
}

impl std::fmt::Display for PlanName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanName::Basic => write!(f, "basic"),
            PlanName::Pro => write!(f, "pro"),
            PlanName::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Outcome of a recorded payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
    Pending,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Succeeded => write!(f, "succeeded"),
            PaymentStatus::Failed => write!(f, "failed"),
            PaymentStatus::Pending => write!(f, "pending"),
        }
    }
}

/// A user in the system.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub pending_email: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    pub is_active: bool,
    pub is_staff: bool,
    pub email_verified: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub date_joined: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.username.clone()
        } else {
            name.to_string()
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Extended account details, one row per user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub user_id: Uuid,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone_number: Option<String>,
    pub owned_projects_count: i32,
    pub participated_projects_count: i32,
}

/// A pending one-time password. Only the SHA-256 of the code is stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OtpVerification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub code_hash: String,
    pub purpose: OtpPurpose,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
}

/// A project owned by one user and shared with its members.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_tasks: i32,
    pub status: ProjectStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub total_member_count: i32,
    pub admin_override: bool,
}

/// A user's membership in a project, with per-member task counters.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectMembership {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub total_tasks: i32,
    pub completed_tasks: i32,
    pub role: MembershipRole,
}

/// An emailed invitation to join a project.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectInvitation {
    pub id: Uuid,
    pub project_id: Uuid,
    pub email: String,
    pub token: Uuid,
    pub invited_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted: bool,
    pub accepted_at: Option<DateTime<Utc>>,
    pub project_name: String,
    pub inviter_email: String,
    pub inviter_name: String,
}

impl ProjectInvitation {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// A unit of work inside a project.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub assigned_by: Option<Uuid>,
    pub total_assignees: i32,
    pub need_approval: bool,
    pub approved_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskAssignment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub assigned_at: DateTime<Utc>,
}

/// A threaded comment on a task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parent_id: Option<Uuid>,
    pub reply_count: i32,
    pub mention_count: i32,
}

/// A request by an assignee to complete a task that needs approval.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusChangeRequest {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub request_time: DateTime<Utc>,
    pub reason: Option<String>,
    pub status: RequestStatus,
    pub approved_by: Option<Uuid>,
    pub resolution_time: Option<DateTime<Utc>>,
}

/// An in-app notification with its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub title: String,
    pub message: String,
    pub url: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub content_type: Option<String>,
    pub object_id: Option<Uuid>,
    pub notification_type: NotificationType,
    pub status: DeliveryStatus,
    pub priority: Priority,
    pub retry_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Real-time payload pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationPreference {
    pub user_id: Uuid,
    pub preferences: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// A purchasable plan and the limits it grants. `-1` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: PlanName,
    pub description: String,
    pub price_cents: i64,
    pub duration_days: i32,
    #[serde(skip_serializing)]
    pub stripe_price_id: Option<String>,
    pub max_projects: i32,
    pub max_members_per_project: i32,
}

impl SubscriptionPlan {
    pub fn allows_projects(&self, owned: i32) -> bool {
        self.max_projects < 0 || owned < self.max_projects
    }

    /// Members other than the owner. Limits of 1 or below are not enforced.
    pub fn allows_members(&self, members: usize) -> bool {
        self.max_members_per_project <= 1 || members as i64 <= self.max_members_per_project as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub stripe_subscription_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub date: DateTime<Utc>,
    pub stripe_payment_intent_id: Option<String>,
    pub status: PaymentStatus,
    pub payment_method: String,
}

/// Audit record of an admin action.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminActionLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub content_type: String,
    pub object_id: Option<Uuid>,
    pub changes: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_status_gates() {
        assert!(ProjectStatus::InProgress.can_create_task());
        assert!(ProjectStatus::Overdue.can_create_task());
        assert!(!ProjectStatus::NotStarted.can_create_task());
        assert!(!ProjectStatus::OnHold.can_perform_activity());
        assert!(ProjectStatus::Overdue.can_perform_activity());
        assert!(ProjectStatus::Completed.is_read_only());
    }

    #[test]
    fn test_project_status_parse() {
        assert_eq!("on_hold".parse::<ProjectStatus>(), Ok(ProjectStatus::OnHold));
        assert!("archived".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn test_comment_types_share_preference_key() {
        assert_eq!(NotificationType::CommentMention.preference_key(), Some("comment"));
        assert_eq!(NotificationType::TaskComment.preference_key(), Some("comment"));
        assert_eq!(NotificationType::AdminNotification.preference_key(), None);
    }

    #[test]
    fn test_plan_limits() {
        let plan = SubscriptionPlan {
            id: Uuid::new_v4(),
            name: PlanName::Basic,
            description: String::new(),
            price_cents: 0,
            duration_days: 30,
            stripe_price_id: None,
            max_projects: 2,
            max_members_per_project: 5,
        };
        assert!(plan.allows_projects(1));
        assert!(!plan.allows_projects(2));
        assert!(plan.allows_members(5));
        assert!(!plan.allows_members(6));

        let unlimited = SubscriptionPlan {
            max_projects: -1,
            max_members_per_project: -1,
            ..plan
        };
        assert!(unlimited.allows_projects(1000));
        assert!(unlimited.allows_members(1000));
    }

    #[test]
    fn test_member_limit_boundary() {
        let plan = |max_members_per_project| SubscriptionPlan {
            id: Uuid::new_v4(),
            name: PlanName::Basic,
            description: String::new(),
            price_cents: 0,
            duration_days: 30,
            stripe_price_id: None,
            max_projects: 1,
            max_members_per_project,
        };
        assert!(plan(2).allows_members(2));
        assert!(!plan(2).allows_members(3));
        assert!(plan(1).allows_members(4));
        assert!(plan(0).allows_members(4));
    }

    #[test]
    fn test_otp_purpose_wire_format() {
        let json = serde_json::to_string(&OtpPurpose::PasswordReset).unwrap();
        assert_eq!(json, "\"PASSWORD_RESET\"");
        assert_eq!(OtpPurpose::EmailChange.describe(), "email change");
    }

    #[test]
    fn test_full_name_falls_back_to_username() {
        let user = User {
            id: Uuid::new_v4(),
            username: "ada".into(),
            email: "ada@example.com".into(),
            pending_email: None,
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            role: UserRole::User,
            is_active: true,
            is_staff: false,
            email_verified: true,
            last_seen: None,
            last_login: None,
            date_joined: Utc::now(),
        };
        assert_eq!(user.full_name(), "ada");
    }
}
