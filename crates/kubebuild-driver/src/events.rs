//! Pod event reporting with de-duplication and fast-fail detection
//!
//! The API server returns the full event list on every poll. [`EventReporter`]
//! surfaces each distinct event once per watch and turns reasons that can never
//! resolve on their own into errors.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Event, Pod};
use tracing::{info, warn};

use kubebuild_common::{Error, Result};

/// Event reason emitted when an image is absent and the pull policy is Never
pub const REASON_IMAGE_NEVER_PULL: &str = "ErrImageNeverPull";

/// Reasons that end a watch immediately
const FATAL_REASONS: &[&str] = &[REASON_IMAGE_NEVER_PULL];

/// Field selector for the events of a single pod.
///
/// The UID clause is only added once the server has assigned one.
pub fn pod_event_selector(pod: &Pod) -> String {
    let mut clauses = vec![
        format!(
            "involvedObject.name={}",
            pod.metadata.name.as_deref().unwrap_or_default()
        ),
        format!(
            "involvedObject.namespace={}",
            pod.metadata.namespace.as_deref().unwrap_or_default()
        ),
        "involvedObject.kind=Pod".to_string(),
    ];
    if let Some(uid) = pod.metadata.uid.as_deref().filter(|u| !u.is_empty()) {
        clauses.push(format!("involvedObject.uid={}", uid));
    }
    clauses.join(",")
}

/// Signature used to de-duplicate an event: `type:subject:reason:message`
pub fn event_signature(event: &Event) -> String {
    format!(
        "{}:{}:{}:{}",
        event.type_.as_deref().unwrap_or_default(),
        event.involved_object.name.as_deref().unwrap_or_default(),
        event.reason.as_deref().unwrap_or_default(),
        event.message.as_deref().unwrap_or_default(),
    )
}

/// Per-watch record of events already reported
#[derive(Debug, Default)]
pub struct EventReporter {
    reported: HashSet<String>,
}

impl EventReporter {
    /// Create an empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Report events not seen before, in the order given.
    ///
    /// Events whose involved object UID differs from `uid` (when set) are
    /// ignored. Returns the signatures reported by this call, or an error as
    /// soon as an event carries a fatal reason.
    pub fn observe(&mut self, events: &[Event], uid: Option<&str>) -> Result<Vec<String>> {
        let mut fresh = Vec::new();
        for event in events {
            if let Some(uid) = uid {
                if event.involved_object.uid.as_deref() != Some(uid) {
                    continue;
                }
            }

            let signature = event_signature(event);
            if !self.reported.insert(signature.clone()) {
                continue;
            }

            if event.type_.as_deref() == Some("Warning") {
                warn!(event = %signature, "pod event");
            } else {
                info!(event = %signature, "pod event");
            }

            let reason = event.reason.as_deref().unwrap_or_default();
            if FATAL_REASONS.contains(&reason) {
                let subject = event.involved_object.name.clone().unwrap_or_default();
                return Err(Error::probe(subject, signature));
            }
            fresh.push(signature);
        }
        Ok(fresh)
    }
}
