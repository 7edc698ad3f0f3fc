//! Types shared by the conversion and quantization stages.

use std::fmt;
use std::str::FromStr;

use crate::PipelineError;

/// A supported reduced-precision profile for `llama-quantize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuantVariant {
    Q4KS,
    Q5KS,
    Q8_0,
}

impl QuantVariant {
    /// Every supported variant, in the order `all` expands to.
    pub const ALL: [QuantVariant; 3] = [QuantVariant::Q4KS, QuantVariant::Q5KS, QuantVariant::Q8_0];

    /// Variant requested when none is given.
    pub const DEFAULT: QuantVariant = QuantVariant::Q5KS;

    /// Identifier passed to `llama-quantize` and used in file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantVariant::Q4KS => "Q4_K_S",
            QuantVariant::Q5KS => "Q5_K_S",
            QuantVariant::Q8_0 => "Q8_0",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            QuantVariant::Q4KS => "4-bit K-quant small",
            QuantVariant::Q5KS => "5-bit K-quant small",
            QuantVariant::Q8_0 => "8-bit (near-lossless)",
        }
    }

    /// Approximate bits per weight.
    pub fn bits_per_weight(&self) -> f32 {
        match self {
            QuantVariant::Q4KS => 4.58,
            QuantVariant::Q5KS => 5.54,
            QuantVariant::Q8_0 => 8.50,
        }
    }

    /// Parse a requested list, expanding `all` and dropping duplicates.
    ///
    /// First-seen order is preserved.
    pub fn parse_list<I, S>(requested: I) -> Result<Vec<QuantVariant>, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut variants = Vec::new();
        for item in requested {
            let item = item.as_ref().trim();
            let expanded: Vec<QuantVariant> = if item.eq_ignore_ascii_case("all") {
                Self::ALL.to_vec()
            } else {
                vec![item.parse()?]
            };
            for variant in expanded {
                if !variants.contains(&variant) {
                    variants.push(variant);
                }
            }
        }
        Ok(variants)
    }
}

impl fmt::Display for QuantVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantVariant {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let supported: Vec<&str> = Self::ALL.iter().map(|v| v.as_str()).collect();
                PipelineError::config(format!(
                    "Unsupported quantization type '{}' (supported: {}, all)",
                    s,
                    supported.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("q5_k_s".parse::<QuantVariant>().unwrap(), QuantVariant::Q5KS);
        assert_eq!("Q8_0".parse::<QuantVariant>().unwrap(), QuantVariant::Q8_0);
        assert!("Q4_K_M".parse::<QuantVariant>().is_err());
    }

    #[test]
    fn test_parse_list_expands_all_and_dedups() {
        let variants = QuantVariant::parse_list(["Q8_0", "all", "q8_0"]).unwrap();
        assert_eq!(
            variants,
            vec![QuantVariant::Q8_0, QuantVariant::Q4KS, QuantVariant::Q5KS]
        );
    }

    #[test]
    fn test_parse_list_rejects_unknown() {
        let err = QuantVariant::parse_list(["Q5_K_S", "Q2_K"]).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("Q2_K"));
    }

    #[test]
    fn test_catalog_is_ordered_by_precision() {
        let bits: Vec<f32> = QuantVariant::ALL.iter().map(|v| v.bits_per_weight()).collect();
        assert!(bits.windows(2).all(|w| w[0] < w[1]));
    }
}
