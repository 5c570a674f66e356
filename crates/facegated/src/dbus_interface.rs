use crate::engine::{
    AuthError, Authenticator, EnrollOutcome, FaceVerdict, PasswordVerdict, RejectReason,
};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Daemon1";
pub const OBJECT_PATH: &str = "/org/facegate/Daemon1";

/// JSON reply body shared by every method: `{success, completed?, msg}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub success: bool,
    pub completed: Option<bool>,
    pub msg: String,
}

impl Reply {
    fn ok(msg: impl Into<String>) -> Self {
        Self {
            success: true,
            completed: None,
            msg: msg.into(),
        }
    }

    fn fail(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            completed: None,
            msg: msg.into(),
        }
    }

    pub fn enroll(outcome: EnrollOutcome, max_samples: usize) -> Self {
        match outcome {
            EnrollOutcome::Saved(count) => Self {
                success: true,
                completed: Some(false),
                msg: format!("Face saved ({count}/{max_samples})"),
            },
            EnrollOutcome::Completed => Self {
                success: true,
                completed: Some(true),
                msg: "Registration completed".into(),
            },
            EnrollOutcome::Rejected(RejectReason::AlreadyEnrolled) => {
                Self::fail("Already fully registered")
            }
            EnrollOutcome::Rejected(RejectReason::NoFaceDetected) => Self::fail("No face detected"),
        }
    }

    pub fn face(verdict: FaceVerdict) -> Self {
        match verdict {
            FaceVerdict::Matched { similarity } => {
                tracing::debug!(similarity, "face matched");
                Self::ok("Login successful")
            }
            FaceVerdict::NotMatched { similarity } => {
                tracing::debug!(similarity, "face did not match");
                Self::fail("Face does not match")
            }
            FaceVerdict::NoFaceDetected => Self::fail("No face detected"),
            FaceVerdict::UserNotRegistered => Self::fail("User not registered"),
        }
    }

    pub fn password(verdict: PasswordVerdict) -> Self {
        match verdict {
            PasswordVerdict::Accepted => Self::ok("Login successful"),
            PasswordVerdict::Rejected => Self::fail("Invalid password"),
            PasswordVerdict::UserNotFound => Self::fail("User not found"),
        }
    }

    /// Log the full error and return only the sanitized message.
    pub fn error(operation: &str, err: &AuthError) -> Self {
        match err {
            AuthError::InvalidInput(_) | AuthError::ImageDecode(_) => {
                tracing::info!(operation, error = %err, "rejected request");
            }
            _ => tracing::error!(operation, error = %err, "request failed"),
        }
        Self::fail(err.user_message())
    }

    pub fn to_json(&self) -> String {
        let mut body = serde_json::json!({
            "success": self.success,
            "msg": self.msg,
        });
        if let Some(completed) = self.completed {
            body["completed"] = completed.into();
        }
        body.to_string()
    }
}

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Daemon1
/// Object path: /org/facegate/Daemon1
pub struct FacegateService {
    auth: Arc<Authenticator>,
}

impl FacegateService {
    pub fn new(auth: Arc<Authenticator>) -> Self {
        Self { auth }
    }

    /// Run a pipeline call on the blocking pool; inference and SQLite must
    /// not stall the D-Bus executor.
    async fn blocking<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&Authenticator) -> T + Send + 'static,
        T: Send + 'static,
    {
        let auth = Arc::clone(&self.auth);
        tokio::task::spawn_blocking(move || f(&auth))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("worker task failed: {e}")))
    }
}

#[interface(name = "org.facegate.Daemon1")]
impl FacegateService {
    /// Store one face sample; the first sample also registers the password.
    async fn enroll(
        &self,
        email: String,
        password: String,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(email = %email, bytes = image.len(), "enroll requested");
        let reply = self
            .blocking(move |auth| match auth.enroll(&email, &password, &image) {
                Ok(outcome) => Reply::enroll(outcome, auth.config().max_samples),
                Err(err) => Reply::error("enroll", &err),
            })
            .await?;
        Ok(reply.to_json())
    }

    /// Verify a probe face against the samples enrolled for `email`.
    async fn verify_face(&self, email: String, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(email = %email, bytes = image.len(), "face login requested");
        let reply = self
            .blocking(move |auth| match auth.verify_face(&email, &image) {
                Ok(verdict) => Reply::face(verdict),
                Err(err) => Reply::error("verify_face", &err),
            })
            .await?;
        Ok(reply.to_json())
    }

    /// Check a password against the stored credential.
    async fn verify_password(&self, email: String, password: String) -> zbus::fdo::Result<String> {
        tracing::info!(email = %email, "password login requested");
        let reply = self
            .blocking(move |auth| match auth.verify_password(&email, &password) {
                Ok(verdict) => Reply::password(verdict),
                Err(err) => Reply::error("verify_password", &err),
            })
            .await?;
        Ok(reply.to_json())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let config = self.auth.config();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "embedder": self.auth.embedder_state().as_str(),
            "confidence_floor": config.confidence_floor,
            "similarity_threshold": config.similarity_threshold,
            "max_samples": config.max_samples,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::ResourceError;

    fn parse(reply: &Reply) -> serde_json::Value {
        serde_json::from_str(&reply.to_json()).unwrap()
    }

    #[test]
    fn saved_reply_reports_progress() {
        let body = parse(&Reply::enroll(EnrollOutcome::Saved(3), 5));
        assert_eq!(body["success"], true);
        assert_eq!(body["completed"], false);
        assert_eq!(body["msg"], "Face saved (3/5)");
    }

    #[test]
    fn completed_reply() {
        let body = parse(&Reply::enroll(EnrollOutcome::Completed, 5));
        assert_eq!(body["success"], true);
        assert_eq!(body["completed"], true);
        assert_eq!(body["msg"], "Registration completed");
    }

    #[test]
    fn rejection_replies() {
        let full = Reply::enroll(EnrollOutcome::Rejected(RejectReason::AlreadyEnrolled), 5);
        assert!(!full.success);
        assert_eq!(full.msg, "Already fully registered");

        let body = parse(&Reply::enroll(
            EnrollOutcome::Rejected(RejectReason::NoFaceDetected),
            5,
        ));
        assert_eq!(body["msg"], "No face detected");
        assert!(body.get("completed").is_none());
    }

    #[test]
    fn face_replies() {
        assert_eq!(
            Reply::face(FaceVerdict::Matched { similarity: 0.8 }),
            Reply::ok("Login successful")
        );
        assert_eq!(
            Reply::face(FaceVerdict::NotMatched { similarity: 0.6 }).msg,
            "Face does not match"
        );
        assert_eq!(Reply::face(FaceVerdict::UserNotRegistered).msg, "User not registered");
        assert_eq!(Reply::face(FaceVerdict::NoFaceDetected).msg, "No face detected");
    }

    #[test]
    fn password_replies() {
        assert!(Reply::password(PasswordVerdict::Accepted).success);
        assert_eq!(Reply::password(PasswordVerdict::Rejected).msg, "Invalid password");
        assert_eq!(Reply::password(PasswordVerdict::UserNotFound).msg, "User not found");
    }

    #[test]
    fn error_reply_hides_internal_detail() {
        let err = AuthError::ResourceInit(ResourceError::Fetch {
            url: "https://models.invalid/secret/path.onnx".into(),
            message: "connection refused".into(),
        });
        let reply = Reply::error("enroll", &err);
        assert!(!reply.success);
        assert!(!reply.msg.contains("models.invalid"));
        assert!(!reply.msg.contains("refused"));
        assert_eq!(reply.msg, "Face recognition temporarily unavailable");

        let reply = Reply::error("enroll", &AuthError::InvalidInput("identity is required"));
        assert_eq!(reply.msg, "Missing data");

        let decode = image::load_from_memory(b"not an image").unwrap_err();
        let reply = Reply::error("verify_face", &AuthError::ImageDecode(decode));
        assert_eq!(reply.msg, "Invalid image");
    }
}
