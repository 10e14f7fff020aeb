use serde::Serialize;

const OOM_PATTERNS: &[&str] = &[
    "out of memory",
    "out-of-memory",
    "oom",
    "cannot allocate memory",
    "cuda out of memory",
    "resource exhausted",
    "killed",
    "signal 9",
    "signal killed",
];

const TRANSIENT_NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection timeout",
    "temporary failure",
    "no such host",
    "network is unreachable",
    "i/o timeout",
];

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    None,
    Oom,
    General,
    Command,
    Interrupted,
    SegmentationFault,
    Signal,
    Unknown,
}

/// ErrorClassification: what an exit code (plus the tail of the log stream)
/// means for the job, and whether a retry is worth attempting.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub exit_code: i64,
    pub kind: FailureKind,
    pub description: String,
    pub is_oom: bool,
    pub recoverable: bool,
    pub recommendation: Option<String>,
}

impl ErrorClassification {
    /// The status message surfaced to the user: description, plus the
    /// recommendation when there is one.
    pub fn user_message(&self) -> String {
        match &self.recommendation {
            Some(recommendation) => format!("{} - {}", self.description, recommendation),
            None => self.description.clone(),
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Maps an exit code and an optional log excerpt to a classification. Rules
/// are evaluated in order; OOM wins over everything because exit 137 and the
/// kernel/driver messages are unambiguous.
pub fn classify_exit(exit_code: i64, log_excerpt: Option<&str>) -> ErrorClassification {
    let lowered = log_excerpt.map(|excerpt| excerpt.to_lowercase()).unwrap_or_default();

    if exit_code == 137 || exit_code == 9 || contains_any(&lowered, OOM_PATTERNS) {
        return ErrorClassification {
            exit_code,
            kind: FailureKind::Oom,
            description: "Out of Memory: the process was killed after exceeding its memory limit".to_string(),
            is_oom: true,
            recoverable: false,
            recommendation: Some("Reduce the batch size or request more memory for this job".to_string()),
        };
    }

    let mut classification = match exit_code {
        0 => ErrorClassification {
            exit_code,
            kind: FailureKind::None,
            description: "Process exited successfully".to_string(),
            is_oom: false,
            recoverable: false,
            recommendation: None,
        },
        1 => ErrorClassification {
            exit_code,
            kind: FailureKind::General,
            description: "General error in the training process".to_string(),
            is_oom: false,
            recoverable: true,
            recommendation: Some("Check the job logs for the failing operation".to_string()),
        },
        126 | 127 => ErrorClassification {
            exit_code,
            kind: FailureKind::Command,
            description: if exit_code == 127 {
                "Command not found inside the container".to_string()
            } else {
                "Command found but not executable".to_string()
            },
            is_oom: false,
            recoverable: false,
            recommendation: Some("Verify the image and the command of this job".to_string()),
        },
        130 => ErrorClassification {
            exit_code,
            kind: FailureKind::Interrupted,
            description: "Process interrupted (SIGINT)".to_string(),
            is_oom: false,
            recoverable: true,
            recommendation: None,
        },
        139 => ErrorClassification {
            exit_code,
            kind: FailureKind::SegmentationFault,
            description: "Segmentation fault in the training process".to_string(),
            is_oom: false,
            recoverable: false,
            recommendation: Some("Usually a native-extension or driver incompatibility; check framework and CUDA versions".to_string()),
        },
        code if code >= 128 => ErrorClassification {
            exit_code,
            kind: FailureKind::Signal,
            description: format!("Process terminated by signal {}", code - 128),
            is_oom: false,
            recoverable: matches!(code, 128 | 255),
            recommendation: None,
        },
        code => ErrorClassification {
            exit_code,
            kind: FailureKind::Unknown,
            description: format!("Process exited with code {code}"),
            is_oom: false,
            recoverable: matches!(code, 1 | 128 | 255),
            recommendation: None,
        },
    };

    // Transient network failures are worth a retry whatever the exit code was.
    if exit_code != 0 && contains_any(&lowered, TRANSIENT_NETWORK_PATTERNS) {
        classification.recoverable = true;
    }

    classification
}
