use serde::Serialize;
use tc_device::Capability;

/// Zero-argument probe answering whether the active build supports a
/// capability.
pub type CapabilityProbe = fn() -> bool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Run,
    Skip { reason: String },
}

impl GateDecision {
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }
}

/// Suite-level precondition, evaluated once before any case runs.
#[derive(Debug, Clone)]
pub struct CapabilityGate {
    required: Option<Capability>,
    reason: String,
    probe: CapabilityProbe,
}

impl CapabilityGate {
    #[must_use]
    pub fn open() -> Self {
        Self {
            required: None,
            reason: String::new(),
            probe: || true,
        }
    }

    #[must_use]
    pub fn requiring(capability: Capability, reason: impl Into<String>) -> Self {
        Self {
            required: Some(capability),
            reason: reason.into(),
            probe: default_probe(capability),
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: CapabilityProbe) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn required(&self) -> Option<Capability> {
        self.required
    }

    #[must_use]
    pub fn evaluate(&self) -> GateDecision {
        let Some(capability) = self.required else {
            return GateDecision::Run;
        };
        if (self.probe)() {
            tracing::debug!(capability = capability.name(), "capability gate open");
            GateDecision::Run
        } else {
            tracing::warn!(
                capability = capability.name(),
                reason = %self.reason,
                "capability missing, suite skipped"
            );
            GateDecision::Skip {
                reason: self.reason.clone(),
            }
        }
    }
}

fn default_probe(capability: Capability) -> CapabilityProbe {
    match capability {
        Capability::NvGpu => || tc_device::probe(Capability::NvGpu),
    }
}

#[cfg(test)]
mod tests {
    use tc_device::Capability;

    use super::{CapabilityGate, GateDecision};

    #[test]
    fn open_gate_always_runs() {
        let gate = CapabilityGate::open().with_probe(|| false);
        assert_eq!(gate.evaluate(), GateDecision::Run);
    }

    #[test]
    fn missing_capability_skips_with_reason() {
        let gate = CapabilityGate::requiring(Capability::NvGpu, "needs accelerator build")
            .with_probe(|| false);
        let decision = gate.evaluate();
        assert!(decision.is_skip());
        assert_eq!(
            decision,
            GateDecision::Skip {
                reason: "needs accelerator build".to_owned()
            }
        );
    }

    #[test]
    fn faked_away_capability_skips() {
        let gate = CapabilityGate::requiring(Capability::NvGpu, "hidden")
            .with_probe(|| tc_device::probe_with(Capability::NvGpu, Some("none")));
        assert!(gate.evaluate().is_skip());
    }

    #[test]
    fn present_capability_runs() {
        let gate = CapabilityGate::requiring(Capability::NvGpu, "unused").with_probe(|| true);
        assert_eq!(gate.evaluate(), GateDecision::Run);
        assert_eq!(gate.required(), Some(Capability::NvGpu));
    }
}
