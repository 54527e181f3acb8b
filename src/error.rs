use thiserror::Error;

use crate::classifier::ClassifyError;
use crate::decision::DecisionError;
use crate::FlowKey;

/// Whether a failure may be skipped for one flow-cycle or must stop the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

/// Failure while evaluating one flow.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("classification failed for flow {flow}: {source}")]
    Classify {
        flow: FlowKey,
        #[source]
        source: ClassifyError,
    },
    #[error("decision failed for flow {flow}: {source}")]
    Decision {
        flow: FlowKey,
        #[source]
        source: DecisionError,
    },
    #[error("flow {flow}: bandwidth-delay product is undefined ({reason})")]
    UndefinedBdp { flow: FlowKey, reason: &'static str },
    #[error("failed to write mitigation for flow {flow}: {cause:#}")]
    Actuator { flow: FlowKey, cause: anyhow::Error },
}

impl EvalError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Classify { source, .. } => source.severity(),
            Self::UndefinedBdp { .. } => Severity::Recoverable,
            Self::Decision { .. } | Self::Actuator { .. } => Severity::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}
