pub mod backup;
pub mod cleanup;
pub mod events;
pub mod lock;
pub mod login;
pub mod mfa;
pub mod rate_limit;
pub mod session;
pub mod totp;
pub mod trusted_device;
pub mod verification;

pub use backup::{BackupCodeManager, BACKUP_CODE_BATCH};
pub use cleanup::{CleanupHandle, CleanupScheduler, CleanupSummary};
pub use events::SecurityEventLog;
pub use lock::{DistributedLock, LockGuard};
pub use login::{LoginGate, LoginLimits, LoginProof, LoginService, MfaLogin, TrustPresentation};
pub use mfa::{Enrollment, EnrollmentRequest, MfaDeviceManager};
pub use rate_limit::{RateDecision, RateLimitStrategy, RateLimiter};
pub use session::{CookieSpec, Session, SessionCookies, SessionMetadata, SessionStore};
pub use totp::{TotpProvisioning, TotpService};
pub use trusted_device::TrustedDeviceManager;
pub use verification::{CodeIssue, CodeSender, LoggingCodeSender, VerificationCodeService};
