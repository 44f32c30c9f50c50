//! Architecture specification: which primitive operators each cell role runs.
//!
//! Primitive names are resolved into closed enums when the specification is
//! built, so the towers never do string lookups at forward time.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Primitive operators available inside encoder/decoder cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    /// Two BN + Swish + 3-tap weight-normalized convolutions.
    ResBnSwish,
    /// Inverted residual with expansion 6 and a 5-tap depthwise convolution.
    MConvE6K5,
    /// Inverted residual with expansion 3 and a 5-tap depthwise convolution.
    MConvE3K5,
}

impl PrimitiveKind {
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "res_bnswish" => Ok(Self::ResBnSwish),
            "mconv_e6k5" => Ok(Self::MConvE6K5),
            "mconv_e3k5" => Ok(Self::MConvE3K5),
            _ => Err(format!("unknown cell primitive: {name}")),
        }
    }
}

/// Primitive operators available inside autoregressive flow cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArPrimitiveKind {
    /// Causal ELU + 3-tap autoregressive convolution on the hidden stream.
    ArConv3x3,
}

impl ArPrimitiveKind {
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "ar_conv_3x3" => Ok(Self::ArConv3x3),
            _ => Err(format!("unknown flow primitive: {name}")),
        }
    }
}

/// Mapping from cell role to the ordered primitive list that role runs.
///
/// Deserializes from a plain `{"role": ["primitive", ...]}` map; unknown
/// roles or primitive names reject the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>")]
pub struct ArchSpec {
    pub normal_pre: Vec<PrimitiveKind>,
    pub down_pre: Vec<PrimitiveKind>,
    pub normal_enc: Vec<PrimitiveKind>,
    pub down_enc: Vec<PrimitiveKind>,
    pub normal_dec: Vec<PrimitiveKind>,
    pub up_dec: Vec<PrimitiveKind>,
    pub normal_post: Vec<PrimitiveKind>,
    pub up_post: Vec<PrimitiveKind>,
    pub ar_nn: Vec<ArPrimitiveKind>,
}

impl ArchSpec {
    /// The residual/mobile-conv instance: plain residual BN-Swish cells on the
    /// encoder side, inverted-residual cells on the decoder side.
    pub fn res_mconv() -> Self {
        Self {
            normal_pre: vec![PrimitiveKind::ResBnSwish, PrimitiveKind::ResBnSwish],
            down_pre: vec![PrimitiveKind::ResBnSwish, PrimitiveKind::ResBnSwish],
            normal_enc: vec![PrimitiveKind::ResBnSwish, PrimitiveKind::ResBnSwish],
            down_enc: vec![PrimitiveKind::ResBnSwish, PrimitiveKind::ResBnSwish],
            normal_dec: vec![PrimitiveKind::MConvE6K5],
            up_dec: vec![PrimitiveKind::MConvE6K5],
            normal_post: vec![PrimitiveKind::MConvE3K5],
            up_post: vec![PrimitiveKind::MConvE3K5],
            ar_nn: vec![ArPrimitiveKind::ArConv3x3],
        }
    }

    /// Every role must name at least one primitive.
    pub fn validate(&self) -> Result<(), String> {
        let roles: [(&str, usize); 9] = [
            ("normal_pre", self.normal_pre.len()),
            ("down_pre", self.down_pre.len()),
            ("normal_enc", self.normal_enc.len()),
            ("down_enc", self.down_enc.len()),
            ("normal_dec", self.normal_dec.len()),
            ("up_dec", self.up_dec.len()),
            ("normal_post", self.normal_post.len()),
            ("up_post", self.up_post.len()),
            ("ar_nn", self.ar_nn.len()),
        ];
        for (role, len) in roles {
            if len == 0 {
                return Err(format!("architecture role {role} has an empty primitive list"));
            }
        }
        Ok(())
    }
}

impl Default for ArchSpec {
    fn default() -> Self {
        Self::res_mconv()
    }
}

impl TryFrom<BTreeMap<String, Vec<String>>> for ArchSpec {
    type Error = String;

    fn try_from(map: BTreeMap<String, Vec<String>>) -> Result<Self, String> {
        let mut spec = Self::res_mconv();
        for (role, names) in map {
            match role.as_str() {
                "ar_nn" => {
                    spec.ar_nn = names
                        .iter()
                        .map(|n| ArPrimitiveKind::parse(n))
                        .collect::<Result<_, _>>()?;
                }
                _ => {
                    let ops: Vec<PrimitiveKind> = names
                        .iter()
                        .map(|n| PrimitiveKind::parse(n))
                        .collect::<Result<_, _>>()?;
                    match role.as_str() {
                        "normal_pre" => spec.normal_pre = ops,
                        "down_pre" => spec.down_pre = ops,
                        "normal_enc" => spec.normal_enc = ops,
                        "down_enc" => spec.down_enc = ops,
                        "normal_dec" => spec.normal_dec = ops,
                        "up_dec" => spec.up_dec = ops,
                        "normal_post" => spec.normal_post = ops,
                        "up_post" => spec.up_post = ops,
                        _ => return Err(format!("unknown cell role: {role}")),
                    }
                }
            }
        }
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_primitives() {
        assert_eq!(
            PrimitiveKind::parse("res_bnswish").unwrap(),
            PrimitiveKind::ResBnSwish
        );
        assert_eq!(
            PrimitiveKind::parse("mconv_e6k5").unwrap(),
            PrimitiveKind::MConvE6K5
        );
        assert!(PrimitiveKind::parse("conv_7x7").is_err());
    }

    #[test]
    fn arch_from_json_overrides_roles() {
        let json = r#"{"normal_enc": ["mconv_e3k5"], "ar_nn": ["ar_conv_3x3"]}"#;
        let spec: ArchSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.normal_enc, vec![PrimitiveKind::MConvE3K5]);
        // untouched roles keep the res_mconv defaults
        assert_eq!(spec.normal_dec, vec![PrimitiveKind::MConvE6K5]);
    }

    #[test]
    fn arch_rejects_unknown_role() {
        let json = r#"{"sideways_enc": ["res_bnswish"]}"#;
        assert!(serde_json::from_str::<ArchSpec>(json).is_err());
    }
}
