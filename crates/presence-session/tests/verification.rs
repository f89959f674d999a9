mod common;

use common::{until, FakeCamera, RecordingGateway, ScriptedModel};
use presence_core::{AnalysisError, FaceErrorCode, SampleOrigin, StillImage};
use presence_session::{
    AttendancePhase, FailurePolicy, SubmissionError, SubmitBlocker, VerificationError,
    VerificationFlow, VerificationPhase, VerificationPolicy,
};
use std::sync::Arc;
use tokio::sync::Notify;

fn flow(
    camera: &Arc<FakeCamera>,
    model: &Arc<ScriptedModel>,
    gateway: &Arc<RecordingGateway>,
    policy: VerificationPolicy,
) -> VerificationFlow {
    VerificationFlow::new(
        camera.clone(),
        model.service(),
        gateway.clone(),
        AttendancePhase::Checkin,
        policy,
    )
}

fn policy(on_failure: FailurePolicy) -> VerificationPolicy {
    VerificationPolicy {
        face_required: true,
        on_failure,
        analyze_on_device: true,
    }
}

fn png_file() -> tempfile::NamedTempFile {
    let image = StillImage::from_gray(vec![120; 16 * 16], 16, 16).unwrap();
    let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    std::io::Write::write_all(&mut file, image.encoded()).unwrap();
    file
}

#[tokio::test(start_paused = true)]
async fn test_capture_releases_camera_and_retake_reopens() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::succeeding();
    let gateway = RecordingGateway::new();
    let flow = flow(&camera, &model, &gateway, policy(FailurePolicy::Block));

    assert_eq!(flow.open().await, VerificationPhase::CameraReady);
    let attempt = flow.capture().await.unwrap();
    assert!(attempt.sample.descriptor.is_some());
    assert_eq!(flow.sample_count(), 1);
    assert!(!flow.is_camera_on());
    assert_eq!(camera.live_tracks(), 0);

    flow.retake().unwrap();
    assert_eq!(flow.sample_count(), 0);
    assert!(flow.is_camera_on());
    assert_eq!(flow.phase(), VerificationPhase::CameraReady);
    assert_eq!(flow.submit_blocker(), Some(SubmitBlocker::NoCapture));
    assert_eq!(camera.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_block_policy_records_and_blocks() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::failing_first(vec![AnalysisError::NoFaceDetected]);
    let gateway = RecordingGateway::new();
    let flow = flow(&camera, &model, &gateway, policy(FailurePolicy::Block));

    flow.open().await;
    let attempt = flow.capture().await.unwrap();
    assert!(attempt.block_submission);
    assert_eq!(attempt.sample.analysis_error, Some(FaceErrorCode::NoFaceDetected));
    assert_eq!(flow.phase(), VerificationPhase::Analyzed { blocked: true });
    assert_eq!(flow.submit_blocker(), Some(SubmitBlocker::Blocked));

    let err = flow.submit("present").await.unwrap_err();
    assert!(matches!(err, VerificationError::Blocked(SubmitBlocker::Blocked)));
    assert!(gateway.attendance.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_warn_policy_submits_with_error_code() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::failing_first(vec![AnalysisError::NoFaceDetected]);
    let gateway = RecordingGateway::new();
    let flow = flow(&camera, &model, &gateway, policy(FailurePolicy::Warn));

    flow.open().await;
    let attempt = flow.capture().await.unwrap();
    assert!(!attempt.block_submission);
    assert!(attempt.warning.is_some());
    assert!(flow.can_submit());

    let receipt = flow.submit("present").await.unwrap();
    assert_eq!(receipt.message, "checkin recorded");
    assert_eq!(flow.phase(), VerificationPhase::Done);

    let sent = gateway.attendance.lock().unwrap();
    assert_eq!(sent[0].phase, AttendancePhase::Checkin);
    assert_eq!(sent[0].status, "present");
    assert_eq!(sent[0].face_error, Some(FaceErrorCode::NoFaceDetected));
    assert!(sent[0].face_descriptor.is_none());
    let evidence = sent[0].evidence.as_ref().unwrap();
    assert_eq!(evidence.mime_type, "image/png");
    assert_eq!(evidence.file_name, "capture.png");
}

#[tokio::test(start_paused = true)]
async fn test_face_optional_method_never_blocks() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::failing_first(vec![AnalysisError::AnalysisFailed("boom".into())]);
    let gateway = RecordingGateway::new();
    let flow = flow(
        &camera,
        &model,
        &gateway,
        VerificationPolicy {
            face_required: false,
            ..VerificationPolicy::default()
        },
    );

    flow.open().await;
    let attempt = flow.capture().await.unwrap();
    assert_eq!(attempt.sample.analysis_error, Some(FaceErrorCode::AnalysisFailed));
    assert!(!attempt.block_submission);
    assert!(attempt.warning.is_none());
    assert!(flow.can_submit());
}

#[tokio::test(start_paused = true)]
async fn test_submit_disabled_while_analysing() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let gate = Arc::new(Notify::new());
    let model = ScriptedModel::gated(gate.clone());
    let gateway = RecordingGateway::new();
    let flow = Arc::new(flow(&camera, &model, &gateway, policy(FailurePolicy::Block)));

    flow.open().await;
    let capture = tokio::spawn({
        let flow = flow.clone();
        async move { flow.capture().await }
    });
    until("analysis started", || model.calls() == 1).await;
    assert_eq!(flow.phase(), VerificationPhase::Captured { pending_analysis: true });
    assert_eq!(flow.submit_blocker(), Some(SubmitBlocker::Analyzing));
    assert!(matches!(
        flow.submit("present").await.unwrap_err(),
        VerificationError::Blocked(SubmitBlocker::Analyzing)
    ));

    gate.notify_one();
    capture.await.unwrap().unwrap();
    assert!(flow.can_submit());
}

#[tokio::test(start_paused = true)]
async fn test_retake_discards_in_flight_analysis() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let gate = Arc::new(Notify::new());
    let model = ScriptedModel::gated(gate.clone());
    let gateway = RecordingGateway::new();
    let flow = Arc::new(flow(&camera, &model, &gateway, policy(FailurePolicy::Block)));

    flow.open().await;
    let capture = tokio::spawn({
        let flow = flow.clone();
        async move { flow.capture().await }
    });
    until("analysis started", || model.calls() == 1).await;

    flow.retake().unwrap();
    gate.notify_one();
    assert!(matches!(capture.await.unwrap(), Err(VerificationError::Discarded)));
    assert!(flow.attempt().is_none());
    assert_eq!(flow.phase(), VerificationPhase::CameraReady);
}

#[tokio::test(start_paused = true)]
async fn test_failed_submission_keeps_attempt() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::succeeding();
    let gateway = RecordingGateway::new();
    let flow = flow(&camera, &model, &gateway, policy(FailurePolicy::Block));

    flow.open().await;
    flow.capture().await.unwrap();
    gateway.fail_next(SubmissionError::Rejected {
        status: 422,
        message: "Face does not match".into(),
    });

    let err = flow.submit("present").await.unwrap_err();
    assert_eq!(err.to_string(), "Face does not match");
    assert_eq!(flow.phase(), VerificationPhase::Failed);
    assert_eq!(flow.sample_count(), 1);

    flow.submit("present").await.unwrap();
    let sent = gateway.attendance.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].face_descriptor.is_some());
    assert!(sent[1].face_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_server_side_analysis_sends_evidence_only() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::succeeding();
    let gateway = RecordingGateway::new();
    let flow = flow(
        &camera,
        &model,
        &gateway,
        VerificationPolicy {
            analyze_on_device: false,
            ..VerificationPolicy::default()
        },
    );

    flow.open().await;
    flow.capture().await.unwrap();
    assert_eq!(flow.phase(), VerificationPhase::Analyzed { blocked: false });
    assert_eq!(model.calls(), 0);

    flow.submit("present").await.unwrap();
    let sent = gateway.attendance.lock().unwrap();
    assert!(sent[0].evidence.is_some());
    assert!(sent[0].face_descriptor.is_none());
    assert!(sent[0].face_error.is_none());
}

#[tokio::test]
async fn test_unreadable_upload_without_camera_is_fatal() {
    let camera = FakeCamera::none();
    let model = ScriptedModel::succeeding();
    let gateway = RecordingGateway::new();
    let flow = flow(&camera, &model, &gateway, policy(FailurePolicy::Block));

    assert_eq!(flow.open().await, VerificationPhase::NoCamera);

    let mut garbage = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut garbage, b"definitely not an image").unwrap();
    let err = flow.choose_file(garbage.path()).await.unwrap_err();
    assert!(matches!(err, VerificationError::FileReadFailed(_)));
    assert_eq!(flow.submit_blocker(), Some(SubmitBlocker::Fatal));

    let good = png_file();
    let attempt = flow.choose_file(good.path()).await.unwrap();
    assert_eq!(attempt.sample.origin, SampleOrigin::Upload);
    assert!(attempt.sample.descriptor.is_some());
    assert!(flow.can_submit());

    flow.submit("present").await.unwrap();
    let sent = gateway.attendance.lock().unwrap();
    let evidence = sent[0].evidence.as_ref().unwrap();
    assert!(evidence.file_name.ends_with(".png"));
}

#[tokio::test]
async fn test_submit_disabled_while_file_is_read() {
    let camera = FakeCamera::none();
    let model = ScriptedModel::succeeding();
    let gateway = RecordingGateway::new();
    let flow = Arc::new(flow(&camera, &model, &gateway, policy(FailurePolicy::Block)));
    flow.open().await;

    // Reading a FIFO blocks until the writer side delivers the bytes.
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("photo.png");
    let made = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
    assert!(made.success());

    let choose = tokio::spawn({
        let flow = flow.clone();
        let fifo = fifo.clone();
        async move { flow.choose_file(&fifo).await }
    });
    until("file read started", || {
        flow.submit_blocker() == Some(SubmitBlocker::FileLoading)
    })
    .await;
    assert!(!flow.can_submit());
    assert!(matches!(
        flow.submit("present").await.unwrap_err(),
        VerificationError::Blocked(SubmitBlocker::FileLoading)
    ));

    let png = png_file();
    let bytes = std::fs::read(png.path()).unwrap();
    tokio::task::spawn_blocking(move || std::fs::write(&fifo, bytes))
        .await
        .unwrap()
        .unwrap();

    let attempt = choose.await.unwrap().unwrap();
    assert_eq!(attempt.sample.origin, SampleOrigin::Upload);
    assert!(flow.can_submit());
    assert!(gateway.attendance.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreadable_upload_with_camera_is_recoverable() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::succeeding();
    let gateway = RecordingGateway::new();
    let flow = flow(&camera, &model, &gateway, policy(FailurePolicy::Block));

    flow.open().await;
    let err = flow.choose_file("/nonexistent/photo.jpg").await.unwrap_err();
    assert!(matches!(err, VerificationError::FileReadFailed(_)));
    assert_eq!(flow.submit_blocker(), Some(SubmitBlocker::NoCapture));
    assert!(flow.is_camera_on());
}

#[tokio::test]
async fn test_close_releases_camera() {
    let camera = FakeCamera::with_devices(&["Integrated Camera"]);
    let model = ScriptedModel::succeeding();
    let gateway = RecordingGateway::new();
    {
        let flow = flow(&camera, &model, &gateway, policy(FailurePolicy::Block));
        flow.open().await;
        assert_eq!(camera.live_tracks(), 1);
    }
    assert_eq!(camera.live_tracks(), 0);
}
