use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;

/// The composed key a response is cached under.
///
/// A key is `"{function_id}_{input_id}"`, where the input id comes from the
/// function's identifier provider. Distinct function identities can never
/// collide because the function id is always the prefix.
#[derive(Debug, Clone, Eq)]
pub struct RequestKey {
    repr: Arc<str>,
}

impl RequestKey {
    pub fn from_parts(function_id: &str, input_id: &str) -> Self {
        RequestKey {
            repr: format!("{function_id}_{input_id}").into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.repr.hash(state);
    }
}

/// Normalizes a function id into a stable lowercase identifier.
///
/// Runs of non-alphanumeric characters collapse into a single `_`; leading
/// and trailing separators are dropped.
pub(crate) fn to_identifier(value: &str) -> String {
    let mut id = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            id.extend(c.to_lowercase());
        } else if !id.is_empty() && !id.ends_with('_') {
            id.push('_');
        }
    }
    if id.ends_with('_') {
        id.pop();
    }
    id
}

/// The default input identifier: a stable hex digest of the input's [`Hash`]
/// implementation. The input itself is never retained.
pub(crate) fn default_identifier<I: Hash>(input: &I) -> String {
    let mut hasher = FxHasher::default();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
