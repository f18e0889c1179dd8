//! The capture cycle.
//!
//! One capture runs through fixed phases: pre-action snapshot, target
//! resolution, annotation, action, post-action snapshot, record. A
//! sequence id is taken from the ledger length and only consumed when the
//! record is appended, so a failed cycle leaves no gap.
//!
//! Failures split two ways. Anything up to and including the pre-action
//! snapshot is fatal and aborts the cycle with nothing written. Once the
//! action has run on the device the transition is real, so later
//! failures are soft: a failing input primitive puts the error in
//! `action_error`, and a failing post snapshot leaves the post fields
//! absent, but the record is written either way.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tapcap_core::error::ApiError;
use tapcap_core::hierarchy::{ControlNode, UiTree};
use tapcap_core::protocol::{
    ActionRequest, CaptureRequest, CaptureTiming, PostCaptureMode, TargetQuery,
    DEFAULT_WAIT_AFTER_MS,
};
use tapcap_core::record::{ActionKind, CaptureRecord, ClickPoint, ImageSet, Ledger};
use tracing::{debug, info, warn};

use crate::annotate::annotate_png;
use crate::bridge::{BridgeError, DeviceBridge};
use crate::daemon::paths;

/// Join bound slack added to an action's own duration for mid captures.
const MID_JOIN_SLACK: Duration = Duration::from_millis(1500);

/// Join bound for actions without an intrinsic duration.
const MID_JOIN_DEFAULT: Duration = Duration::from_millis(1000);

/// A full device observation at one instant.
struct Snapshot {
    xml: String,
    png: Vec<u8>,
    activity: Option<String>,
}

/// Runs capture cycles against one device and one ledger.
///
/// Not internally synchronized; the daemon serializes access so a whole
/// cycle holds the device and ledger exclusively.
pub struct CaptureOrchestrator {
    bridge: Arc<dyn DeviceBridge>,
    ledger: Ledger,
    out_dir: PathBuf,
    armed: Option<Snapshot>,
}

impl CaptureOrchestrator {
    pub fn new(bridge: Arc<dyn DeviceBridge>, out_dir: PathBuf) -> Result<Self, ApiError> {
        paths::ensure_output_dirs(&out_dir)
            .map_err(|e| ApiError::ledger(format!("cannot create output layout: {e}")))?;
        let ledger = Ledger::load(paths::records_path(&out_dir));
        info!(
            records = ledger.len(),
            out_dir = %out_dir.display(),
            "orchestrator ready"
        );
        Ok(Self {
            bridge,
            ledger,
            out_dir,
            armed: None,
        })
    }

    pub fn bridge(&self) -> &Arc<dyn DeviceBridge> {
        &self.bridge
    }

    pub fn record_count(&self) -> u64 {
        self.ledger.len()
    }

    pub fn output_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Run one driven capture cycle.
    pub async fn capture(&mut self, request: CaptureRequest) -> Result<CaptureRecord, ApiError> {
        let pre = self.take_snapshot().await?;
        let tree = UiTree::parse(&pre.xml)?;

        let node = match &request.target {
            Some(query) => Some(resolve_target(&tree, query)?),
            None => None,
        };
        let point = match &node {
            Some(node) => {
                let bounds = node.bounds().ok_or_else(|| {
                    ApiError::resolution("resolved node has no usable bounds")
                })?;
                Some(bounds.center())
            }
            None => None,
        };

        let seq = self.ledger.next_sequence_id();
        let raw_name = format!("{seq:03}_raw.png");
        let pre_xml_name = format!("{seq:03}_pre.xml");
        self.write_image(&raw_name, &pre.png)?;
        self.write_xml(&pre_xml_name, &pre.xml)?;

        let boxed_name = match (&node, point) {
            (Some(node), Some(_)) => {
                let rect = node.bounds().expect("bounds checked above");
                let boxed = annotate_png(&pre.png, rect)?;
                let name = format!("{seq:03}_boxed.png");
                self.write_image(&name, &boxed)?;
                Some(name)
            }
            _ => None,
        };

        let (post, action_error) = self
            .act_and_observe(&request.action, point, request.timing)
            .await;

        let (post_name, post_xml_name) = match &post {
            Some(post) => {
                let post_name = format!("{seq:03}_post.png");
                let post_xml_name = format!("{seq:03}_post.xml");
                self.write_image(&post_name, &post.png)?;
                self.write_xml(&post_xml_name, &post.xml)?;
                (Some(post_name), Some(post_xml_name))
            }
            None => (None, None),
        };

        let dest_activity = post.and_then(|post| post.activity);
        let activity_changed = match (&pre.activity, &dest_activity) {
            (Some(src), Some(dst)) => Some(src != dst),
            _ => None,
        };
        let record = CaptureRecord {
            sequence_id: seq,
            time: timestamp(),
            action: action_kind(&request.action),
            click: point.map(|(x, y)| ClickPoint { x, y }),
            node,
            images: ImageSet {
                raw: raw_name,
                boxed: boxed_name,
                post: post_name,
            },
            pre_xml: pre_xml_name,
            post_xml: post_xml_name,
            input_text: match &request.action {
                ActionRequest::Text { text } => Some(text.clone()),
                _ => None,
            },
            swipe_direction: match &request.action {
                ActionRequest::Swipe { motion, .. } => {
                    motion.direction_name().map(str::to_string)
                }
                _ => None,
            },
            swipe_distance: match &request.action {
                ActionRequest::Swipe { motion, .. } => motion.distance(),
                _ => None,
            },
            duration_ms: match &request.action {
                ActionRequest::LongClick { duration_ms }
                | ActionRequest::Swipe { duration_ms, .. } => Some(*duration_ms),
                _ => None,
            },
            source_activity: pre.activity,
            dest_activity,
            activity_changed,
            action_error,
        };
        let id = self.ledger.append(record)?;
        debug!(sequence_id = id, "capture recorded");
        Ok(self.ledger.records()[id as usize].clone())
    }

    /// Capture the current screen so a later observed gesture can be
    /// attributed to the state the user actually saw.
    pub async fn arm_presnapshot(&mut self) -> Result<(), ApiError> {
        let snapshot = self.take_snapshot().await?;
        self.armed = Some(snapshot);
        Ok(())
    }

    /// Record a gesture the user performed physically, against the armed
    /// pre-action snapshot. Without one the screen already shows the
    /// gesture's effect, so the gesture is dropped rather than recorded
    /// against a state it did not happen on.
    pub async fn record_observed_gesture(
        &mut self,
        x: i32,
        y: i32,
    ) -> Result<Option<CaptureRecord>, ApiError> {
        let Some(pre) = self.armed.take() else {
            warn!(x, y, "no armed snapshot, dropping observed gesture");
            return Ok(None);
        };
        let tree = UiTree::parse(&pre.xml)?;
        let node = tree.node_at_point(x, y);

        let seq = self.ledger.next_sequence_id();
        let raw_name = format!("{seq:03}_raw.png");
        let pre_xml_name = format!("{seq:03}_pre.xml");
        self.write_image(&raw_name, &pre.png)?;
        self.write_xml(&pre_xml_name, &pre.xml)?;

        let boxed_name = match node.as_ref().and_then(|n| n.bounds()) {
            Some(rect) => {
                let boxed = annotate_png(&pre.png, rect)?;
                let name = format!("{seq:03}_boxed.png");
                self.write_image(&name, &boxed)?;
                Some(name)
            }
            None => None,
        };

        tokio::time::sleep(Duration::from_millis(DEFAULT_WAIT_AFTER_MS)).await;
        let post = self.post_snapshot().await;
        let (post_name, post_xml_name) = match &post {
            Some(post) => {
                let post_name = format!("{seq:03}_post.png");
                let post_xml_name = format!("{seq:03}_post.xml");
                self.write_image(&post_name, &post.png)?;
                self.write_xml(&post_xml_name, &post.xml)?;
                (Some(post_name), Some(post_xml_name))
            }
            None => (None, None),
        };

        let dest_activity = post.and_then(|post| post.activity);
        let activity_changed = match (&pre.activity, &dest_activity) {
            (Some(src), Some(dst)) => Some(src != dst),
            _ => None,
        };
        let record = CaptureRecord {
            sequence_id: seq,
            time: timestamp(),
            action: ActionKind::Click,
            click: Some(ClickPoint { x, y }),
            node,
            images: ImageSet {
                raw: raw_name,
                boxed: boxed_name,
                post: post_name,
            },
            pre_xml: pre_xml_name,
            post_xml: post_xml_name,
            input_text: None,
            swipe_direction: None,
            swipe_distance: None,
            duration_ms: None,
            source_activity: pre.activity,
            dest_activity,
            activity_changed,
            action_error: None,
        };
        let id = self.ledger.append(record)?;
        info!(sequence_id = id, x, y, "observed gesture recorded");
        Ok(Some(self.ledger.records()[id as usize].clone()))
    }

    /// Record the current screen as a terminal state. No action, no
    /// target, no post snapshot.
    pub async fn final_snapshot(&mut self) -> Result<CaptureRecord, ApiError> {
        let snapshot = self.take_snapshot().await?;
        let seq = self.ledger.next_sequence_id();
        let raw_name = format!("{seq:03}_raw.png");
        let pre_xml_name = format!("{seq:03}_pre.xml");
        self.write_image(&raw_name, &snapshot.png)?;
        self.write_xml(&pre_xml_name, &snapshot.xml)?;

        let record = CaptureRecord {
            sequence_id: seq,
            time: timestamp(),
            action: ActionKind::Final,
            click: None,
            node: None,
            images: ImageSet {
                raw: raw_name,
                boxed: None,
                post: None,
            },
            pre_xml: pre_xml_name,
            post_xml: None,
            input_text: None,
            swipe_direction: None,
            swipe_distance: None,
            duration_ms: None,
            source_activity: snapshot.activity,
            dest_activity: None,
            activity_changed: None,
            action_error: None,
        };
        let id = self.ledger.append(record)?;
        info!(sequence_id = id, "final snapshot recorded");
        Ok(self.ledger.records()[id as usize].clone())
    }

    /// Drive the action and take the second snapshot, honoring the timing
    /// mode. Returns the snapshot (absent when it failed) plus any soft
    /// action error.
    async fn act_and_observe(
        &self,
        action: &ActionRequest,
        point: Option<(i32, i32)>,
        timing: CaptureTiming,
    ) -> (Option<Snapshot>, Option<String>) {
        match timing.mode {
            PostCaptureMode::Post => {
                let action_error = drive_action(self.bridge.as_ref(), action, point)
                    .await
                    .err()
                    .map(|e| e.to_string());
                tokio::time::sleep(Duration::from_millis(timing.wait_after_ms)).await;
                (self.post_snapshot().await, action_error)
            }
            PostCaptureMode::Mid { delay_ms } => {
                let bridge = self.bridge.clone();
                let task_action = action.clone();
                let handle = tokio::spawn(async move {
                    drive_action(bridge.as_ref(), &task_action, point).await
                });

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Only a failure confirmed before the capture is attached
                // to the record. An outcome that arrives later describes a
                // screen the snapshot never saw, so it is logged instead.
                if handle.is_finished() {
                    let action_error = match handle.await {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(join_err) => Some(format!("action task failed: {join_err}")),
                    };
                    return (self.post_snapshot().await, action_error);
                }

                let snapshot = self.post_snapshot().await;
                let bound = match action {
                    ActionRequest::LongClick { duration_ms }
                    | ActionRequest::Swipe { duration_ms, .. } => {
                        Duration::from_millis(*duration_ms) + MID_JOIN_SLACK
                    }
                    _ => MID_JOIN_DEFAULT,
                };
                match tokio::time::timeout(bound, handle).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => warn!("action failed after the mid capture: {e}"),
                    Ok(Err(join_err)) => warn!("action task failed: {join_err}"),
                    Err(_) => warn!("action did not finish within {bound:?}"),
                }
                (snapshot, None)
            }
        }
    }

    /// Second snapshot of a cycle. The action already happened, so a
    /// failure here must not discard the record; it is logged and the
    /// post fields stay empty.
    async fn post_snapshot(&self) -> Option<Snapshot> {
        match self.take_snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("post snapshot failed, recording without it: {e}");
                None
            }
        }
    }

    async fn take_snapshot(&self) -> Result<Snapshot, ApiError> {
        let xml = self
            .bridge
            .dump_hierarchy()
            .await
            .map_err(snapshot_error)?;
        let png = self
            .bridge
            .screenshot_png()
            .await
            .map_err(snapshot_error)?;
        // The activity is context, not ground truth; its absence never
        // blocks a capture.
        let activity = self.bridge.foreground_activity().await.unwrap_or_default();
        Ok(Snapshot { xml, png, activity })
    }

    fn write_image(&self, name: &str, bytes: &[u8]) -> Result<(), ApiError> {
        let path = paths::image_dir(&self.out_dir).join(name);
        std::fs::write(&path, bytes)
            .map_err(|e| ApiError::ledger(format!("cannot write {}: {e}", path.display())))
    }

    fn write_xml(&self, name: &str, xml: &str) -> Result<(), ApiError> {
        let path = paths::xml_dir(&self.out_dir).join(name);
        std::fs::write(&path, xml)
            .map_err(|e| ApiError::ledger(format!("cannot write {}: {e}", path.display())))
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn action_kind(action: &ActionRequest) -> ActionKind {
    match action {
        ActionRequest::Click => ActionKind::Click,
        ActionRequest::LongClick { .. } => ActionKind::LongClick,
        ActionRequest::Swipe { .. } => ActionKind::Swipe,
        ActionRequest::Text { .. } => ActionKind::Text,
        ActionRequest::Back => ActionKind::Back,
    }
}

fn resolve_target(tree: &UiTree, query: &TargetQuery) -> Result<ControlNode, ApiError> {
    match query {
        TargetQuery::Bounds(bounds) => tree.node_by_bounds(bounds).ok_or_else(|| {
            ApiError::resolution(format!("no node with bounds {bounds}"))
        }),
        TargetQuery::Path(path) => tree
            .node_by_path(path)
            .ok_or_else(|| ApiError::resolution(format!("no node matches path {path}"))),
    }
}

/// Bridge failures around snapshots: unreachable transports are
/// connection errors, everything else is a capture failure.
fn snapshot_error(err: BridgeError) -> ApiError {
    match err {
        BridgeError::Unreachable(_) | BridgeError::Http(_) => ApiError::connection(err.to_string()),
        _ => ApiError::capture(err.to_string()),
    }
}

/// Execute one input primitive. `point` is present for every action that
/// was validated to need a target.
async fn drive_action(
    bridge: &dyn DeviceBridge,
    action: &ActionRequest,
    point: Option<(i32, i32)>,
) -> Result<(), BridgeError> {
    match action {
        ActionRequest::Click => {
            let (x, y) = expect_point(point)?;
            bridge.tap(x, y).await
        }
        ActionRequest::LongClick { duration_ms } => {
            let (x, y) = expect_point(point)?;
            bridge.long_press(x, y, *duration_ms).await
        }
        ActionRequest::Swipe {
            motion,
            duration_ms,
        } => {
            let (x, y) = expect_point(point)?;
            let (ex, ey) = motion.destination(x, y);
            bridge.swipe(x, y, ex, ey, *duration_ms).await
        }
        ActionRequest::Text { text } => bridge.input_text(text).await,
        ActionRequest::Back => bridge.key_back().await,
    }
}

fn expect_point(point: Option<(i32, i32)>) -> Result<(i32, i32), BridgeError> {
    point.ok_or_else(|| BridgeError::Command("action requires a resolved point".to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use image::{ImageFormat, Rgba, RgbaImage};
    use tapcap_core::error::ErrorCode;
    use tapcap_core::protocol::CaptureSpec;

    use super::*;

    const HIERARCHY: &str = r#"<hierarchy>
      <node class="android.widget.FrameLayout" bounds="[0,0][1080,1920]">
        <node class="android.widget.Button" text="Send" bounds="[100,200][300,260]"/>
        <node class="android.widget.EditText" text="" bounds="[100,300][900,360]"/>
      </node>
    </hierarchy>"#;

    fn png_bytes() -> Vec<u8> {
        let img = RgbaImage::from_pixel(1080, 400, Rgba([0, 0, 0, 255]));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    /// Scripted bridge that records every call.
    struct MockBridge {
        calls: Mutex<Vec<String>>,
        activities: Mutex<Vec<String>>,
        fail_taps: bool,
        action_delay: Duration,
        /// Successful hierarchy dumps remaining, `None` for unlimited.
        dump_budget: Mutex<Option<usize>>,
    }

    impl MockBridge {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                activities: Mutex::new(vec![
                    "com.example/.Home".to_string(),
                    "com.example/.Detail".to_string(),
                ]),
                fail_taps: false,
                action_delay: Duration::ZERO,
                dump_budget: Mutex::new(None),
            }
        }

        fn failing_taps() -> Self {
            Self {
                fail_taps: true,
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl DeviceBridge for MockBridge {
        async fn is_ready(&self) -> bool {
            true
        }

        async fn dump_hierarchy(&self) -> Result<String, BridgeError> {
            self.log("dump".to_string());
            if let Some(budget) = self.dump_budget.lock().unwrap().as_mut() {
                if *budget == 0 {
                    return Err(BridgeError::Command("dump failed".to_string()));
                }
                *budget -= 1;
            }
            Ok(HIERARCHY.to_string())
        }

        async fn screenshot_png(&self) -> Result<Vec<u8>, BridgeError> {
            self.log("screenshot".to_string());
            Ok(png_bytes())
        }

        async fn foreground_activity(&self) -> Result<Option<String>, BridgeError> {
            let mut activities = self.activities.lock().unwrap();
            let next = if activities.len() > 1 {
                activities.remove(0)
            } else {
                activities[0].clone()
            };
            Ok(Some(next))
        }

        async fn tap(&self, x: i32, y: i32) -> Result<(), BridgeError> {
            self.log(format!("tap {x},{y}"));
            if self.fail_taps {
                return Err(BridgeError::Command("input rejected".to_string()));
            }
            Ok(())
        }

        async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), BridgeError> {
            self.log(format!("long_press {x},{y} {duration_ms}"));
            tokio::time::sleep(self.action_delay).await;
            Ok(())
        }

        async fn swipe(
            &self,
            x1: i32,
            y1: i32,
            x2: i32,
            y2: i32,
            duration_ms: u64,
        ) -> Result<(), BridgeError> {
            self.log(format!("swipe {x1},{y1} -> {x2},{y2} {duration_ms}"));
            tokio::time::sleep(self.action_delay).await;
            Ok(())
        }

        async fn input_text(&self, text: &str) -> Result<(), BridgeError> {
            self.log(format!("text {text}"));
            Ok(())
        }

        async fn key_back(&self) -> Result<(), BridgeError> {
            self.log("back".to_string());
            Ok(())
        }
    }

    fn request(json: &str) -> CaptureRequest {
        serde_json::from_str::<CaptureSpec>(json)
            .unwrap()
            .validate()
            .unwrap()
    }

    async fn orchestrator(bridge: Arc<MockBridge>) -> (CaptureOrchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let orch = CaptureOrchestrator::new(bridge, dir.path().to_path_buf()).unwrap();
        (orch, dir)
    }

    #[tokio::test]
    async fn click_cycle_writes_record_and_artifacts() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, dir) = orchestrator(bridge.clone()).await;

        let record = orch
            .capture(request(
                r#"{"action":"click","bounds":"[100,200][300,260]","waitAfterMs":0}"#,
            ))
            .await
            .unwrap();

        assert_eq!(record.sequence_id, 0);
        assert_eq!(record.action, ActionKind::Click);
        assert_eq!(record.click, Some(ClickPoint { x: 200, y: 230 }));
        assert_eq!(record.source_activity.as_deref(), Some("com.example/.Home"));
        assert_eq!(record.dest_activity.as_deref(), Some("com.example/.Detail"));
        assert_eq!(record.activity_changed, Some(true));
        assert!(record.action_error.is_none());
        assert!(bridge.calls().contains(&"tap 200,230".to_string()));

        let image_dir = paths::image_dir(dir.path());
        assert!(image_dir.join("000_raw.png").exists());
        assert!(image_dir.join("000_boxed.png").exists());
        assert!(image_dir.join("000_post.png").exists());
        assert!(paths::xml_dir(dir.path()).join("000_pre.xml").exists());
        assert!(paths::records_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn unresolved_target_aborts_without_consuming_a_sequence_id() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, _dir) = orchestrator(bridge.clone()).await;

        let err = orch
            .capture(request(r#"{"action":"click","bounds":"[9,9][9,9]"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Resolution);
        assert_eq!(orch.record_count(), 0);
        assert!(!bridge.calls().iter().any(|c| c.starts_with("tap")));

        let record = orch
            .capture(request(
                r#"{"action":"click","bounds":"[100,200][300,260]","waitAfterMs":0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(record.sequence_id, 0);
    }

    #[tokio::test]
    async fn failed_input_primitive_is_a_soft_error() {
        let bridge = Arc::new(MockBridge::failing_taps());
        let (mut orch, _dir) = orchestrator(bridge).await;

        let record = orch
            .capture(request(
                r#"{"action":"click","bounds":"[100,200][300,260]","waitAfterMs":0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(record.sequence_id, 0);
        let error = record.action_error.unwrap();
        assert!(error.contains("input rejected"));
        assert_eq!(orch.record_count(), 1);
    }

    #[tokio::test]
    async fn back_has_no_rectangle_and_no_click() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, dir) = orchestrator(bridge.clone()).await;

        let record = orch
            .capture(request(r#"{"action":"back","waitAfterMs":0}"#))
            .await
            .unwrap();
        assert_eq!(record.action, ActionKind::Back);
        assert!(record.click.is_none());
        assert!(record.node.is_none());
        assert!(record.images.boxed.is_none());
        assert!(bridge.calls().contains(&"back".to_string()));
        assert!(!paths::image_dir(dir.path()).join("000_boxed.png").exists());
    }

    #[tokio::test]
    async fn swipe_records_motion_and_clamps_destination() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, _dir) = orchestrator(bridge.clone()).await;

        let record = orch
            .capture(request(
                r#"{"action":"swipe","bounds":"[100,200][300,260]",
                    "direction":"up","distance":900,"durationMs":120,"waitAfterMs":0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(record.swipe_direction.as_deref(), Some("up"));
        assert_eq!(record.swipe_distance, Some(900));
        assert_eq!(record.duration_ms, Some(120));
        // Center is (200, 230); 900 up clamps to y = 0.
        assert!(bridge
            .calls()
            .contains(&"swipe 200,230 -> 200,0 120".to_string()));
    }

    #[tokio::test]
    async fn text_action_types_without_tapping() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, _dir) = orchestrator(bridge.clone()).await;

        let record = orch
            .capture(request(
                r#"{"action":"text","bounds":"[100,300][900,360]","text":"hello","waitAfterMs":0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(record.input_text.as_deref(), Some("hello"));
        // The target is still resolved and annotated, but typing goes to
        // the focused field as-is.
        assert_eq!(record.click, Some(ClickPoint { x: 500, y: 330 }));
        let calls = bridge.calls();
        assert!(calls.contains(&"text hello".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("tap")));
    }

    #[tokio::test]
    async fn failed_post_snapshot_still_writes_the_record() {
        let bridge = Arc::new(MockBridge {
            dump_budget: Mutex::new(Some(1)),
            ..MockBridge::new()
        });
        let (mut orch, dir) = orchestrator(bridge.clone()).await;

        let record = orch
            .capture(request(
                r#"{"action":"click","bounds":"[100,200][300,260]","waitAfterMs":0}"#,
            ))
            .await
            .unwrap();

        // The tap ran, so the transition is kept; only the post fields
        // stay empty.
        assert!(bridge.calls().contains(&"tap 200,230".to_string()));
        assert_eq!(record.sequence_id, 0);
        assert!(record.images.post.is_none());
        assert!(record.post_xml.is_none());
        assert!(record.dest_activity.is_none());
        assert!(record.activity_changed.is_none());
        assert_eq!(orch.record_count(), 1);

        let image_dir = paths::image_dir(dir.path());
        assert!(image_dir.join("000_raw.png").exists());
        assert!(!image_dir.join("000_post.png").exists());
    }

    #[tokio::test]
    async fn mid_capture_snapshots_while_action_runs() {
        let bridge = Arc::new(MockBridge {
            action_delay: Duration::from_millis(150),
            ..MockBridge::new()
        });
        let (mut orch, _dir) = orchestrator(bridge.clone()).await;

        let record = orch
            .capture(request(
                r#"{"action":"long_click","bounds":"[100,200][300,260]",
                    "durationMs":150,"midCapture":true,"midDelayMs":10}"#,
            ))
            .await
            .unwrap();
        assert!(record.action_error.is_none());
        assert!(record.images.post.is_some());
        // The action was still driven exactly once.
        let presses = bridge
            .calls()
            .iter()
            .filter(|c| c.starts_with("long_press"))
            .count();
        assert_eq!(presses, 1);
    }

    #[tokio::test]
    async fn mid_capture_attaches_only_failures_confirmed_before_capture() {
        let bridge = Arc::new(MockBridge::failing_taps());
        let (mut orch, _dir) = orchestrator(bridge).await;

        // A failing tap is instant, so it resolves during the mid delay
        // and the failure is already confirmed when the snapshot runs.
        let record = orch
            .capture(request(
                r#"{"action":"click","bounds":"[100,200][300,260]",
                    "midCapture":true,"midDelayMs":10}"#,
            ))
            .await
            .unwrap();
        assert!(record.action_error.unwrap().contains("input rejected"));
    }

    #[tokio::test]
    async fn observed_gesture_uses_armed_snapshot() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, _dir) = orchestrator(bridge.clone()).await;

        orch.arm_presnapshot().await.unwrap();
        let dumps_after_arm = bridge.calls().iter().filter(|c| *c == "dump").count();

        let record = orch.record_observed_gesture(150, 230).await.unwrap().unwrap();
        assert_eq!(record.click, Some(ClickPoint { x: 150, y: 230 }));
        let node = record.node.unwrap();
        assert_eq!(node.attr("text"), Some("Send"));
        // Pre state came from the armed snapshot, only the post capture
        // dumped again.
        let dumps_total = bridge.calls().iter().filter(|c| *c == "dump").count();
        assert_eq!(dumps_total, dumps_after_arm + 1);
    }

    #[tokio::test]
    async fn unarmed_observed_gesture_is_dropped() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, _dir) = orchestrator(bridge.clone()).await;

        let record = orch.record_observed_gesture(150, 230).await.unwrap();
        assert!(record.is_none());
        assert_eq!(orch.record_count(), 0);
        // Nothing was asked of the device.
        assert!(bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn final_snapshot_records_terminal_state() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, _dir) = orchestrator(bridge).await;

        let record = orch.final_snapshot().await.unwrap();
        assert_eq!(record.action, ActionKind::Final);
        assert!(record.post_xml.is_none());
        assert!(record.images.post.is_none());
        assert!(record.images.boxed.is_none());
        assert!(record.source_activity.is_some());
    }

    #[tokio::test]
    async fn sequence_ids_stay_dense_across_kinds() {
        let bridge = Arc::new(MockBridge::new());
        let (mut orch, _dir) = orchestrator(bridge).await;

        let a = orch
            .capture(request(r#"{"action":"back","waitAfterMs":0}"#))
            .await
            .unwrap();
        orch.arm_presnapshot().await.unwrap();
        let b = orch.record_observed_gesture(200, 230).await.unwrap().unwrap();
        let c = orch.final_snapshot().await.unwrap();
        assert_eq!((a.sequence_id, b.sequence_id, c.sequence_id), (0, 1, 2));
    }
}
