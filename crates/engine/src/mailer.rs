//! Transactional email templates.
//!
//! Rendering is pure; delivery is deferred to the background worker by
//! pushing a [`Job::SendEmail`] onto the job queue.

use redis::aio::ConnectionManager;

use planner_common::error::AppError;
use planner_common::queue::{Job, JobQueue};
use planner_common::types::ProjectInvitation;

pub const OTP_SUBJECT: &str = "Your OTP Code";

const FOOTER: &str = r#"<hr style="border: none; border-top: 1px solid #ddd; margin: 20px 0;">
<footer style="font-size: 0.9em; color: #777;">
    <p>Thank you for choosing our service!</p>
    <p>&copy; 2025 Project Planner. All rights reserved.</p>
</footer>"#;

/// Escape text for interpolation into HTML.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap an HTML fragment in the standard layout and footer.
pub fn render_layout(body: &str) -> String {
    format!(
        r#"<html>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
{body}
{FOOTER}
</body>
</html>"#
    )
}

pub fn render_otp(code: &str) -> String {
    render_layout(&format!(
        r#"<h2 style="color: #4CAF50;">Your OTP Code</h2>
<p>Dear User,</p>
<p>We received a request to verify your email address. Use the OTP code below to complete the process:</p>
<p style="font-size: 1.5em; font-weight: bold; color: #4CAF50;">{}</p>
<p>If you did not request this, please ignore this email.</p>"#,
        escape_html(code)
    ))
}

pub fn invitation_accept_url(base_url: &str, invitation: &ProjectInvitation) -> String {
    format!(
        "{}/api/v1/projects/invite/accept/?token={}",
        base_url.trim_end_matches('/'),
        invitation.token
    )
}

pub fn invitation_subject(invitation: &ProjectInvitation) -> String {
    format!("Invitation to join project: {}", invitation.project_name)
}

pub fn render_invitation(base_url: &str, invitation: &ProjectInvitation) -> String {
    render_layout(&format!(
        r#"<h2 style="color: #4CAF50;">You're Invited to Join a Project!</h2>
<p>Dear User,</p>
<p>You've been invited to join the project "{project}" by {inviter}.</p>
<p>To accept this invitation, please click on the following link:</p>
<p><a href="{url}" style="color: #4CAF50;">Accept Invitation</a></p>
<p>This invitation will expire on {expires}.</p>
<p>If you don't have an account, you'll be able to create one when you click the link.</p>"#,
        project = escape_html(&invitation.project_name),
        inviter = escape_html(&invitation.inviter_name),
        url = invitation_accept_url(base_url, invitation),
        expires = invitation.expires_at.format("%Y-%m-%d %H:%M:%S"),
    ))
}

pub struct Mailer;

impl Mailer {
    /// Queue an email whose body is already a full HTML document.
    pub async fn enqueue(
        redis: &mut ConnectionManager,
        recipient: &str,
        subject: &str,
        html: String,
    ) -> Result<(), AppError> {
        JobQueue::enqueue(
            redis,
            Job::SendEmail {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                html,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn send_otp(
        redis: &mut ConnectionManager,
        recipient: &str,
        code: &str,
    ) -> Result<(), AppError> {
        Self::enqueue(redis, recipient, OTP_SUBJECT, render_otp(code)).await
    }

    /// Queue an arbitrary HTML fragment wrapped in the standard layout.
    pub async fn send_custom(
        redis: &mut ConnectionManager,
        recipient: &str,
        subject: &str,
        body_html: &str,
    ) -> Result<(), AppError> {
        Self::enqueue(redis, recipient, subject, render_layout(body_html)).await
    }

    pub async fn send_invitation(
        redis: &mut ConnectionManager,
        base_url: &str,
        invitation: &ProjectInvitation,
    ) -> Result<(), AppError> {
        Self::enqueue(
            redis,
            &invitation.email,
            &invitation_subject(invitation),
            render_invitation(base_url, invitation),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;

    fn invitation() -> ProjectInvitation {
        ProjectInvitation {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            email: "guest@example.com".into(),
            token: Uuid::nil(),
            invited_by: Uuid::new_v4(),
            created_at: Utc::now(),
            expires_at: Utc.with_ymd_and_hms(2025, 3, 8, 12, 0, 0).unwrap(),
            accepted: false,
            accepted_at: None,
            project_name: "Apollo <beta>".into(),
            inviter_email: "owner@example.com".into(),
            inviter_name: "Grace Hopper".into(),
        }
    }

    #[test]
    fn test_otp_email_contains_code_and_footer() {
        let html = render_otp("123456");
        assert!(html.contains("123456"));
        assert!(html.contains("Thank you for choosing our service!"));
        assert!(html.contains("Project Planner. All rights reserved."));
    }

    #[test]
    fn test_invitation_email() {
        let inv = invitation();
        assert_eq!(invitation_subject(&inv), "Invitation to join project: Apollo <beta>");

        let html = render_invitation("https://planner.test/", &inv);
        assert!(html.contains("Apollo &lt;beta&gt;"));
        assert!(html.contains(
            "https://planner.test/api/v1/projects/invite/accept/?token=00000000-0000-0000-0000-000000000000"
        ));
        assert!(html.contains("2025-03-08 12:00:00"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
