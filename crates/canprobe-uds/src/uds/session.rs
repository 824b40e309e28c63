//! Per-endpoint UDS session and security-access state

use super::session_type;

/// Diagnostic session and security state of one endpoint.
///
/// Invariant: in the default session the security level is always 0 —
/// entering 0x01 (and any ECU reset) re-locks security, per ISO 14229.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsSession {
    /// Active diagnostic session sub-function (0x01 default, 0x02
    /// programming, 0x03 extended, or implementation-defined)
    pub session_type: u8,
    /// 0 = locked; otherwise the odd request level that was unlocked
    pub security_level: u8,
    /// Seed received but key not yet sent, with its request level
    pub pending_seed: Option<(u8, Vec<u8>)>,
    /// Whether the tester-present keepalive is running
    pub tester_present_enabled: bool,
}

impl UdsSession {
    /// Apply a positive DiagnosticSessionControl response.
    pub fn enter_session(&mut self, session: u8) {
        self.session_type = session;
        // Security access resets on every transition into default
        if session == session_type::DEFAULT {
            self.lock();
        }
    }

    /// Re-lock security access (session change to default, ECU reset).
    pub fn lock(&mut self) {
        self.security_level = 0;
        self.pending_seed = None;
    }

    pub fn is_unlocked(&self) -> bool {
        self.security_level != 0
    }
}

impl Default for UdsSession {
    fn default() -> Self {
        Self {
            session_type: session_type::DEFAULT,
            security_level: 0,
            pending_seed: None,
            tester_present_enabled: false,
        }
    }
}
