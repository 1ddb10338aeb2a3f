use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::clock;
use crate::sink::sanitize_component;

/// Identifying fields entered by the operator before a session starts.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub user: String,
    pub mode: Option<String>,
    pub session_type: Option<String>,
}

impl SessionRequest {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = Some(session_type.into());
        self
    }

    pub fn user(&self) -> Option<&str> {
        let user = self.user.trim();
        (!user.is_empty()).then_some(user)
    }

    /// `<root>/<user>/[<mode>/][<session_type>/]<stamp>`; empty optional parts
    /// are left out.
    pub fn session_dir(&self, root: &Path, at: DateTime<Utc>) -> Option<PathBuf> {
        let mut dir = root.join(sanitize_component(self.user()?));
        for part in [&self.mode, &self.session_type].into_iter().flatten() {
            if !part.trim().is_empty() {
                dir.push(sanitize_component(part));
            }
        }
        dir.push(clock::file_stamp(at));
        Some(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn builds_nested_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap();
        let root = Path::new("sessions");
        let dir = SessionRequest::for_user(" alice ")
            .with_mode("rec")
            .with_session_type("dream")
            .session_dir(root, at)
            .unwrap();
        assert_eq!(
            dir,
            Path::new("sessions/alice/rec/dream/2024-03-02T10-00-00-000000")
        );
        let plain = SessionRequest::for_user("bob")
            .with_mode("  ")
            .session_dir(root, at)
            .unwrap();
        assert_eq!(plain, Path::new("sessions/bob/2024-03-02T10-00-00-000000"));
    }

    #[test]
    fn empty_user_has_no_directory() {
        let at = Utc::now();
        assert!(SessionRequest::for_user("   ")
            .session_dir(Path::new("s"), at)
            .is_none());
    }

    #[test]
    fn user_with_separators_stays_inside_root() {
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap();
        let dir = SessionRequest::for_user("../x")
            .session_dir(Path::new("root"), at)
            .unwrap();
        assert!(dir.starts_with("root/.._x"));
    }
}
