use mender_core::repair::RepairEvent;
use mender_core::session::SessionStatus;
use mender_core::types::{CircuitBreakerState, RepairStatus, RuntimeRepairRequest};

pub fn event(event: &RepairEvent) -> String {
    match event {
        RepairEvent::Started { request } => format!(
            "repair #{} started: [{}] {}",
            request.attempt_id, request.error.kind, request.error.message
        ),
        RepairEvent::Succeeded { request, patches } => {
            let paths: Vec<&str> = patches.iter().map(|p| p.path.as_str()).collect();
            format!("repair #{} applied: {}", request.attempt_id, paths.join(", "))
        }
        RepairEvent::Failed { request, reason } => {
            format!("repair #{} failed: {reason}", request.attempt_id)
        }
        RepairEvent::Tripped { reason, stats } => {
            format!("repairs blocked: {reason}\n{}", breaker(stats))
        }
    }
}

pub fn breaker(s: &CircuitBreakerState) -> String {
    let state = if s.tripped { "tripped" } else { "closed" };
    let mut out = format!(
        "breaker {state}: {} consecutive failures, {} attempts ({} ok, {} failed)",
        s.consecutive_failures, s.total_attempts, s.total_successes, s.total_failures
    );
    if let Some(reason) = &s.tripped_reason {
        out.push_str(&format!("\n  reason: {reason}"));
    }
    out
}

pub fn status(s: &SessionStatus) -> String {
    format!(
        "{}\nsandbox {}, in flight: {}, pending: {}, superseded: {}\nreports: {} received, {} discarded, {} duplicates",
        breaker(&s.breaker),
        if s.sandbox_alive { "online" } else { "silent" },
        s.in_flight.map_or_else(|| "none".to_string(), |id| format!("#{id}")),
        s.pending,
        s.superseded,
        s.classifier.received,
        s.classifier.discarded,
        s.classifier.duplicates,
    )
}

pub fn history(entries: &[RuntimeRepairRequest]) -> String {
    if entries.is_empty() {
        return "no repair attempts yet".into();
    }
    entries
        .iter()
        .map(|r| {
            let outcome = match r.status {
                RepairStatus::Succeeded => format!("ok    {}", r.patched_paths.join(", ")),
                RepairStatus::Failed => format!("fail  {}", r.failure.as_deref().unwrap_or("")),
                RepairStatus::Pending => "pending".to_string(),
            };
            format!("#{:<3} {:<18} {outcome}\n      {}", r.attempt_id, r.error.kind.as_str(), r.error.message)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
