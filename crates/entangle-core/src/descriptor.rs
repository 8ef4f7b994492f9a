//! Resource descriptors
//!
//! A descriptor is the normalized view of a resource that the diffusion
//! engine works with. Producing one from raw content is the job of a
//! [`DescriptorSource`]; the engine never looks at content itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{EntangleError, EntangleResult};

/// Declared participation of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredState {
    /// Receives diffusion only when the probability draw allows it
    #[default]
    Dormant,
    /// Standing subscription: always receives diffusion from a neighbor
    Active,
}

impl DeclaredState {
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("active") {
            DeclaredState::Active
        } else {
            DeclaredState::Dormant
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeclaredState::Dormant => "dormant",
            DeclaredState::Active => "active",
        }
    }
}

/// Content hash used to detect change between polls
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Fingerprint(bytes)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Normalized resource descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub declared_state: DeclaredState,
    pub linked_ids: Vec<String>,
    /// Diffusion weight, clamped into [0, 1]
    pub strength: f64,
    pub fingerprint: Fingerprint,
}

impl Descriptor {
    pub fn new(fingerprint: Fingerprint, strength: f64) -> Self {
        Descriptor {
            declared_state: DeclaredState::Dormant,
            linked_ids: Vec::new(),
            strength: clamp_strength(strength),
            fingerprint,
        }
    }

    pub fn with_state(mut self, state: DeclaredState) -> Self {
        self.declared_state = state;
        self
    }

    pub fn with_links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.linked_ids = links.into_iter().map(Into::into).collect();
        self
    }

    pub fn active(self) -> Self {
        self.with_state(DeclaredState::Active)
    }
}

fn clamp_strength(strength: f64) -> f64 {
    if strength.is_nan() {
        0.0
    } else {
        strength.clamp(0.0, 1.0)
    }
}

/// Turns raw content into a descriptor
///
/// Implementations must be pure and cheap enough to run on every poll cycle.
/// Content without usable metadata yields [`EntangleError::NotEligible`].
pub trait DescriptorSource: Send + Sync {
    fn describe(&self, content: &[u8]) -> EntangleResult<Descriptor>;
}

/// Number of leading lines searched for header markers
pub const HEADER_SCAN_LINES: usize = 64;

const STATE_KEY: &str = "entangle-state";
const LINKS_KEY: &str = "entangle-links";
const STRENGTH_KEY: &str = "entangle-strength";
const COMMENT_PREFIXES: [&str; 4] = ["//", "#", "--", ";"];

/// Reads `entangle-*` header markers from text content
///
/// ```text
/// # entangle-state: active
/// # entangle-links: notes/todo.md, design
/// # entangle-strength: 0.8
/// ```
#[derive(Debug, Clone)]
pub struct HeaderDescriptorSource {
    default_strength: f64,
}

impl HeaderDescriptorSource {
    pub fn new(default_strength: f64) -> Self {
        Self {
            default_strength: clamp_strength(default_strength),
        }
    }
}

impl Default for HeaderDescriptorSource {
    fn default() -> Self {
        Self::new(crate::EntangleConfig::default().default_strength)
    }
}

impl DescriptorSource for HeaderDescriptorSource {
    fn describe(&self, content: &[u8]) -> EntangleResult<Descriptor> {
        let text = String::from_utf8_lossy(content);
        let mut seen = false;
        let mut descriptor = Descriptor::new(Fingerprint::of(content), self.default_strength);

        for line in text.lines().take(HEADER_SCAN_LINES) {
            let Some((key, value)) = header_entry(line) else {
                continue;
            };

            match key.as_str() {
                STATE_KEY => descriptor.declared_state = DeclaredState::parse(value),
                LINKS_KEY => {
                    descriptor.linked_ids.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|l| !l.is_empty())
                            .map(String::from),
                    );
                }
                STRENGTH_KEY => match value.trim().parse::<f64>() {
                    Ok(s) => descriptor.strength = clamp_strength(s),
                    Err(_) => {
                        tracing::debug!(value, "unparsable strength, keeping default");
                    }
                },
                _ => continue,
            }
            seen = true;
        }

        if seen {
            Ok(descriptor)
        } else {
            Err(EntangleError::NotEligible)
        }
    }
}

fn header_entry(line: &str) -> Option<(String, &str)> {
    let mut rest = line.trim_start();
    for prefix in COMMENT_PREFIXES {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped.trim_start();
            break;
        }
    }
    let (key, value) = rest.split_once(':')?;
    let key = key.trim().to_ascii_lowercase();
    key.starts_with("entangle-").then_some((key, value.trim()))
}
