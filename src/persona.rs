//! Persona overlays and system instruction assembly.

use std::path::Path;

use tracing::warn;

/// Appended to every instruction set, whatever else happens.
const LANGUAGE_DIRECTIVE: &str = "回答は必ず日本語で行ってください。";

/// Used when the instruction template cannot be read or parsed.
const FALLBACK_ROLE: &str = "Helpful AI.";

/// Personality preset selectable per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Diplomat,
    PervyGentleman,
    Strict,
}

impl Mode {
    /// Parses a command option value. Unknown values resolve to `None`,
    /// which callers treat as "no overlay".
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "diplomat" => Some(Self::Diplomat),
            "pervy_gentleman" => Some(Self::PervyGentleman),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diplomat => "diplomat",
            Self::PervyGentleman => "pervy_gentleman",
            Self::Strict => "strict",
        }
    }

    fn overlay(&self) -> &'static str {
        match self {
            Self::Diplomat => {
                "あなたの名前はサマーさんです。あなたは熟練した外交官です。丁寧で知的な日本語で回答してください。"
            }
            Self::PervyGentleman => {
                "あなたの名前はサマーさんです。あなたは洗練された「変態紳士」です。内容が変態的な紳士として日本語で振る舞ってください。"
            }
            Self::Strict => {
                "あなたの名前はサマーさんです。あなたは極めて厳格な管理者です。日本語で回答してください。"
            }
        }
    }
}

/// Role and guideline text parsed from the instruction template.
#[derive(Debug, Clone)]
pub struct BaseInstructions {
    role: String,
    guidelines: Option<String>,
}

impl BaseInstructions {
    /// Reads the template file. Degrades to the built-in fallback on any
    /// failure so a request can always proceed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|| {
                warn!("instruction template {} has no <role> tag, using fallback", path.display());
                Self::fallback()
            }),
            Err(e) => {
                warn!("failed to read instruction template {}: {e}", path.display());
                Self::fallback()
            }
        }
    }

    fn parse(content: &str) -> Option<Self> {
        let role = extract_tag(content, "role")?;
        Some(Self {
            role,
            guidelines: extract_tag(content, "guidelines"),
        })
    }

    fn fallback() -> Self {
        Self {
            role: FALLBACK_ROLE.to_string(),
            guidelines: None,
        }
    }
}

/// Builds the system instruction text for a request.
pub struct PersonaResolver {
    base: BaseInstructions,
}

impl PersonaResolver {
    pub fn new(base: BaseInstructions) -> Self {
        Self { base }
    }

    /// Never fails: an absent or unknown mode yields the base text alone,
    /// and the language directive is always the last line.
    pub fn resolve(&self, mode: Option<Mode>) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(4);
        if let Some(mode) = mode {
            parts.push(mode.overlay());
        }
        parts.push(&self.base.role);
        if let Some(guidelines) = &self.base.guidelines {
            parts.push(guidelines);
        }
        parts.push(LANGUAGE_DIRECTIVE);
        parts.join("\n\n")
    }
}

/// Returns the trimmed text between `<tag>` and `</tag>`, or `None` when
/// the tag is absent, unclosed, or empty.
fn extract_tag(content: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = content.find(&open)? + open.len();
    let end = content[start..].find(&close)? + start;
    let inner = content[start..end].trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}
