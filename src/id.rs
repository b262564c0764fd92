//! ID generation for jobs and transactions.
//!
//! Format: [optional caller prefix][4-char prefix][26-char nanoid]
//! Alphabet: lowercase alphanumeric (0-9, a-z), which is also valid in job ids

/// Lowercase alphabet; a subset of the characters the warehouse allows in job ids
const ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Longest job id the warehouse accepts
const MAX_JOB_ID_LEN: usize = 1024;

/// The type of resource ID, determining its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceId {
    Job,
    Transaction,
}

impl ResourceId {
    /// Returns the 4-character prefix for this resource ID type.
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Job => "bqjb",
            Self::Transaction => "txns",
        }
    }
}

/// Generate a 30-char ID: 4-char prefix + 26-char nanoid (lowercase alphanumeric).
pub fn generate_id(resource: ResourceId) -> String {
    let suffix = nanoid::nanoid!(26, &ID_ALPHABET);
    format!("{}{}", resource.prefix(), suffix)
}

/// Generate a job id, optionally led by a caller prefix.
///
/// Characters outside `[A-Za-z0-9_-]` in the prefix are replaced with `_` so the
/// result is always a valid job id.
pub fn generate_job_id(prefix: Option<&str>) -> String {
    let base = generate_id(ResourceId::Job);
    match prefix {
        Some(p) if !p.is_empty() => {
            let cleaned: String = p
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .take(MAX_JOB_ID_LEN - base.len())
                .collect();
            format!("{cleaned}{base}")
        }
        _ => base,
    }
}

/// Generate a transaction ID (prefix: "txns").
pub fn generate_transaction_id() -> String {
    generate_id(ResourceId::Transaction)
}
