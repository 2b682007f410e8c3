//! Bounce/complaint classification. Consumes the SMTP
//! response a `transport::Transport` attempt produced (already folded into
//! `models::AttemptClassification` for the transient/permanent/deferred/
//! tls_fail split) and the richer enhanced-status-code table below to
//! decide whether an address should be suppressed, plus ARF complaint
//! parsing for inbound abuse reports landing on the MX listener.

use crate::models::SuppressionReason;

/// The classifier's own output vocabulary: a superset of
/// `models::AttemptClassification` since it additionally distinguishes
/// `complaint` and whether a `permanent` result should suppress the
/// recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceClass {
    Success,
    Transient,
    Permanent { suppress: bool },
    Complaint,
}

/// Classifies a `(code, enhanced_status)` pair against the bounce table below.
/// `enhanced_status` is the `x.y.z` enhanced code (RFC 3463) parsed out of
/// the SMTP response text, when present.
pub fn classify_smtp(code: u16, enhanced_status: Option<&str>) -> BounceClass {
    match code {
        200..=299 => BounceClass::Success,
        421 | 450..=452 => BounceClass::Transient,
        500..=599 => classify_permanent(enhanced_status),
        _ => BounceClass::Transient,
    }
}

fn classify_permanent(enhanced_status: Option<&str>) -> BounceClass {
    match enhanced_status {
        Some("5.1.1") | Some("5.1.2") => BounceClass::Permanent { suppress: true },
        Some(code) if code.starts_with("5.7.") => BounceClass::Permanent { suppress: false },
        _ => BounceClass::Permanent { suppress: false },
    }
}

impl BounceClass {
    pub fn suppression_reason(&self) -> Option<SuppressionReason> {
        match self {
            BounceClass::Permanent { suppress: true } => Some(SuppressionReason::HardBounce),
            BounceClass::Complaint => Some(SuppressionReason::Complaint),
            _ => None,
        }
    }
}

/// Minimal Abuse Reporting Format (RFC 5965) detector: ARF complaints are
/// `multipart/report; report-type=feedback-report` messages with a
/// `machine-readable-body` part starting `Feedback-Type: abuse`. Full MIME
/// parsing is delegated to `mail_parser`; this just looks for the marker
/// once the structure is confirmed multipart/report.
pub fn is_arf_complaint(content_type: &str, body: &str) -> bool {
    content_type.to_ascii_lowercase().contains("report-type=feedback-report")
        && body.lines().any(|line| line.trim_start().eq_ignore_ascii_case("Feedback-Type: abuse"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_table_rows() {
        assert_eq!(classify_smtp(250, None), BounceClass::Success);
        assert_eq!(classify_smtp(450, Some("4.2.2")), BounceClass::Transient);
        assert_eq!(classify_smtp(421, None), BounceClass::Transient);
        assert_eq!(classify_smtp(550, Some("5.1.1")), BounceClass::Permanent { suppress: true });
        assert_eq!(classify_smtp(550, Some("5.1.2")), BounceClass::Permanent { suppress: true });
        assert_eq!(classify_smtp(550, Some("5.7.1")), BounceClass::Permanent { suppress: false });
        assert_eq!(classify_smtp(550, Some("5.5.0")), BounceClass::Permanent { suppress: false });
    }

    #[test]
    fn suppression_reason_follows_class() {
        assert_eq!(
            BounceClass::Permanent { suppress: true }.suppression_reason(),
            Some(SuppressionReason::HardBounce)
        );
        assert_eq!(BounceClass::Permanent { suppress: false }.suppression_reason(), None);
        assert_eq!(BounceClass::Complaint.suppression_reason(), Some(SuppressionReason::Complaint));
        assert_eq!(BounceClass::Transient.suppression_reason(), None);
    }

    #[test]
    fn detects_arf_complaint() {
        let content_type = "multipart/report; report-type=feedback-report; boundary=xyz";
        let body = "Some preamble\nFeedback-Type: abuse\nUser-Agent: test\n";
        assert!(is_arf_complaint(content_type, body));
        assert!(!is_arf_complaint("text/plain", body));
    }
}
