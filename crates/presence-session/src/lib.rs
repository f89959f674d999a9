//! presence-session — Capture sessions for face enrollment and attendance.
//!
//! A [`CaptureSession`] owns the camera; the flows own a session and drive
//! it through their state machines, funnelling every still through the
//! [`CaptureOrchestrator`] before handing results to a [`SubmissionGateway`].

pub mod capture;
pub mod enrollment;
pub mod gateway;
pub mod session;
pub mod verification;

pub use capture::{
    Admission, AnalysisOutcome, AnalysisTicket, CaptureMode, CaptureOrchestrator, SampleSet,
};
pub use enrollment::{
    CaptureOutcome, EnrollmentError, EnrollmentEvent, EnrollmentFlow, EnrollmentOptions,
    EnrollmentPhase,
};
pub use gateway::{
    AttendancePhase, AttendanceReceipt, EnrollmentPayload, EnrollmentReceipt, Evidence,
    HttpGateway, ProfileStatus, SubmissionError, SubmissionGateway, VerificationPayload,
};
pub use session::CaptureSession;
pub use verification::{
    FailurePolicy, SubmitBlocker, VerificationAttempt, VerificationError, VerificationEvent,
    VerificationFlow, VerificationPhase, VerificationPolicy,
};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
