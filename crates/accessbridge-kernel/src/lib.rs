use accessbridge_contracts::{
    AccessRequest, ActorIdentity, InboundActionKind, RequestState, Resolution, ResolutionTag,
    Review,
};
use chrono::SecondsFormat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LabelKey {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl LabelKey {
    pub const ALL: [LabelKey; 4] = [
        LabelKey::Pending,
        LabelKey::Approved,
        LabelKey::Denied,
        LabelKey::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LabelKey::Pending => "pending",
            LabelKey::Approved => "approved",
            LabelKey::Denied => "denied",
            LabelKey::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        LabelKey::ALL.into_iter().find(|key| key.as_str() == raw)
    }

    fn title(self) -> &'static str {
        match self {
            LabelKey::Pending => "Pending",
            LabelKey::Approved => "Approved",
            LabelKey::Denied => "Denied",
            LabelKey::Expired => "Expired",
        }
    }

    pub fn for_resolution(tag: ResolutionTag) -> Option<Self> {
        match tag {
            ResolutionTag::Unresolved => None,
            ResolutionTag::Approved => Some(LabelKey::Approved),
            ResolutionTag::Denied => Some(LabelKey::Denied),
            ResolutionTag::Expired => Some(LabelKey::Expired),
        }
    }
}

pub fn label_name(prefix: &str, key: LabelKey) -> String {
    format!("{prefix}: {}", key.title())
}

// Head before the first ':' must equal prefix, ignoring ASCII case.
pub fn reduce_label_name(prefix: &str, name: &str) -> Option<LabelKey> {
    let (head, tail) = name.split_once(':')?;
    if !head.trim().eq_ignore_ascii_case(prefix.trim()) {
        return None;
    }
    LabelKey::parse(&tail.trim().to_lowercase())
}

pub fn reviews_to_post(reviews: &[Review], already_posted: usize) -> &[Review] {
    if already_posted >= reviews.len() {
        return &[];
    }
    &reviews[already_posted..]
}

pub fn resolution_for_state(state: RequestState, reason: &str) -> Option<Resolution> {
    match state {
        RequestState::Pending => None,
        RequestState::Approved => Some(Resolution::new(ResolutionTag::Approved, reason)),
        RequestState::Denied => Some(Resolution::new(ResolutionTag::Denied, reason)),
    }
}

pub fn resolution_for_action(kind: &InboundActionKind, reason: &str) -> Option<Resolution> {
    let tag = match kind {
        InboundActionKind::Approve => ResolutionTag::Approved,
        InboundActionKind::Deny => ResolutionTag::Denied,
        InboundActionKind::ResolveCustom(name) => match name.trim().to_lowercase().as_str() {
            "approve" | "approved" => ResolutionTag::Approved,
            "deny" | "denied" | "reject" | "rejected" => ResolutionTag::Denied,
            _ => return None,
        },
    };
    Some(Resolution::new(tag, reason))
}

pub fn state_for_resolution(tag: ResolutionTag) -> Option<RequestState> {
    match tag {
        ResolutionTag::Approved => Some(RequestState::Approved),
        ResolutionTag::Denied => Some(RequestState::Denied),
        ResolutionTag::Unresolved | ResolutionTag::Expired => None,
    }
}

pub fn action_reason(tag: ResolutionTag, actor: &ActorIdentity, reason: &str) -> String {
    let who = actor.display();
    let base = if who.is_empty() {
        format!("{} from the issue tracker", tag.as_str())
    } else {
        format!("{} by {who} from the issue tracker", tag.as_str())
    };
    if reason.trim().is_empty() {
        base
    } else {
        format!("{base}: {}", reason.trim())
    }
}

pub fn resolution_comment(resolution: &Resolution) -> String {
    let mut out = format!("Access request has been {}", resolution.tag.as_str());
    if !resolution.reason.trim().is_empty() {
        out.push_str("\n\nReason: ");
        out.push_str(resolution.reason.trim());
    }
    out
}

pub fn review_comment(review: &Review) -> String {
    let mut out = format!(
        "**{}** reviewed the request at {}.\n\nResolution: **{}**.",
        review.author,
        review
            .created
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        review.proposed_state.as_str().to_uppercase()
    );
    if !review.reason.trim().is_empty() {
        out.push_str("\n\nReason: ");
        out.push_str(review.reason.trim());
    }
    out
}

pub fn ticket_title(req: &AccessRequest) -> String {
    format!("Access request from {}", req.user)
}

pub fn ticket_description(req: &AccessRequest) -> String {
    let mut out = format!(
        "User **{}** requested an access on {} with the following roles:\n\n",
        req.user,
        req.created.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    for role in &req.roles {
        out.push_str(&format!("* {role}\n"));
    }
    out.push_str(&format!("\nRequest ID: `{}`\n", req.id));
    if !req.request_reason.trim().is_empty() {
        out.push_str(&format!("\nReason: {}\n", req.request_reason.trim()));
    }
    out
}

// Lies in [base, previous * 3], capped at cap.
pub fn decorrelated_backoff(previous: Duration, base: Duration, cap: Duration) -> Duration {
    let low = base.as_micros() as u64;
    let high = (previous.as_micros() as u64).saturating_mul(3).max(low);
    let width = high - low;
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    let jitter = if width == 0 {
        0
    } else {
        mixed % width.saturating_add(1)
    };
    Duration::from_micros(low.saturating_add(jitter)).min(cap)
}
