//! Pipeline variants and garment categories.

use serde::{Deserialize, Serialize};

/// A loadable pipeline configuration.
///
/// Each variant has its own checkpoints and accepts a fixed set of garment
/// categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variant {
    /// Half-body model, upper-body garments only
    #[serde(rename = "hd", alias = "half_body")]
    HalfBody,
    /// Full-body model, every category
    #[serde(rename = "dc", alias = "full_body")]
    FullBody,
}

impl Variant {
    /// All variants for iteration.
    pub const ALL: [Variant; 2] = [Variant::HalfBody, Variant::FullBody];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::HalfBody => "hd",
            Variant::FullBody => "dc",
        }
    }

    /// Parse a variant id, accepting the short ids and their long aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hd" | "half_body" | "half-body" => Some(Variant::HalfBody),
            "dc" | "full_body" | "full-body" => Some(Variant::FullBody),
            _ => None,
        }
    }

    /// Whether this variant can dress the given garment category.
    pub fn accepts(&self, category: Category) -> bool {
        match self {
            Variant::HalfBody => category == Category::UpperBody,
            Variant::FullBody => true,
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Garment placement class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    UpperBody,
    LowerBody,
    Dress,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::UpperBody, Category::LowerBody, Category::Dress];

    /// Numeric code used on the wire (0, 1, 2).
    pub fn code(&self) -> u8 {
        match self {
            Category::UpperBody => 0,
            Category::LowerBody => 1,
            Category::Dress => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Category::UpperBody),
            1 => Some(Category::LowerBody),
            2 => Some(Category::Dress),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "upperbody" | "upper_body" | "upper-body" => Some(Category::UpperBody),
            "lowerbody" | "lower_body" | "lower-body" => Some(Category::LowerBody),
            "dress" | "dresses" => Some(Category::Dress),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::UpperBody => write!(f, "upperbody"),
            Category::LowerBody => write!(f, "lowerbody"),
            Category::Dress => write!(f, "dress"),
        }
    }
}

/// Load state of a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum VariantStatus {
    /// Not loaded yet, will load on first demand
    Unloaded,
    /// A load is in flight
    Loading,
    /// Loaded and ready for inference
    Ready,
    /// The last load failed
    Failed {
        /// Attempts made so far
        attempts: u32,
        /// False once the retry budget is exhausted
        retryable: bool,
    },
}

impl VariantStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, VariantStatus::Ready)
    }

    pub fn is_permanently_failed(&self) -> bool {
        matches!(self, VariantStatus::Failed { retryable: false, .. })
    }
}
