//! Model configuration.

pub mod arch;

pub use arch::{ArPrimitiveKind, ArchSpec, PrimitiveKind};

use candle_core::Result;
use serde::Deserialize;

/// Channel multiplier applied at every resolution change.
pub const CHANNEL_MULT: usize = 2;

/// Construction-time configuration for [`crate::model::Autoencoder`].
///
/// All fields have defaults so a config JSON only needs to name what it
/// overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input sequence length (samples per training window).
    pub sample_length: usize,
    /// Number of paired autoregressive flows applied per latent group.
    pub num_flows: usize,
    /// Number of resolution scales carrying latent variables.
    pub num_latent_scales: usize,
    /// Latent groups at the finest scale.
    pub num_groups_per_scale: usize,
    /// Channels per latent group.
    pub num_latent_per_group: usize,
    /// Floor on groups per scale when `ada_groups` halves the count.
    pub min_groups_per_scale: usize,
    /// Halve the group count at each coarser scale.
    pub ada_groups: bool,
    /// Encoder cells per conditional.
    pub num_cell_per_cond_enc: usize,
    /// Decoder cells per conditional.
    pub num_cell_per_cond_dec: usize,
    /// Base encoder channel width.
    pub num_channels_enc: usize,
    /// Base decoder channel width.
    pub num_channels_dec: usize,
    /// Pre-process blocks (each ends in a downsampling cell).
    pub num_preprocess_blocks: usize,
    /// Cells per pre-process block.
    pub num_preprocess_cells: usize,
    /// Post-process blocks (each starts with an upsampling cell).
    pub num_postprocess_blocks: usize,
    /// Cells per post-process block.
    pub num_postprocess_cells: usize,
    /// Squeeze-excite gating inside cells.
    pub use_se: bool,
    /// Express posterior parameters as residuals on top of the prior.
    pub res_dist: bool,
    /// Accepted for config compatibility. The tensor backend has no
    /// recompute-on-backward primitive, so execution always runs the plain
    /// layer-wise path and this flag does not change outputs.
    pub grad_checkpoint: bool,
    /// Quantization bit depth of the output distribution.
    pub num_x_bits: usize,
    /// Logistic mixture components in the output distribution.
    pub num_mix_output: usize,
    /// Cell role -> primitive operator lists.
    pub arch: ArchSpec,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sample_length: 1024,
            num_flows: 0,
            num_latent_scales: 1,
            num_groups_per_scale: 1,
            num_latent_per_group: 20,
            min_groups_per_scale: 1,
            ada_groups: false,
            num_cell_per_cond_enc: 1,
            num_cell_per_cond_dec: 1,
            num_channels_enc: 32,
            num_channels_dec: 32,
            num_preprocess_blocks: 1,
            num_preprocess_cells: 2,
            num_postprocess_blocks: 1,
            num_postprocess_cells: 2,
            use_se: true,
            res_dist: true,
            grad_checkpoint: false,
            num_x_bits: 8,
            num_mix_output: 10,
            arch: ArchSpec::res_mconv(),
        }
    }
}

impl ModelConfig {
    /// Parse a configuration from JSON, falling back to defaults for missing
    /// fields.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| candle_core::Error::Msg(format!("invalid model config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the towers cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.num_latent_scales == 0 || self.num_groups_per_scale == 0 {
            candle_core::bail!("need at least one latent scale and one group per scale");
        }
        if self.min_groups_per_scale == 0 {
            candle_core::bail!("min_groups_per_scale must be at least 1");
        }
        if self.num_latent_per_group == 0 {
            candle_core::bail!("num_latent_per_group must be at least 1");
        }
        if self.num_cell_per_cond_enc == 0 || self.num_cell_per_cond_dec == 0 {
            candle_core::bail!("cells per conditional must be at least 1");
        }
        if self.num_preprocess_cells == 0 || self.num_postprocess_cells == 0 {
            candle_core::bail!("pre/post-process cells per block must be at least 1");
        }
        if self.num_x_bits == 0 || self.num_x_bits > 16 {
            candle_core::bail!("num_x_bits must be in 1..=16, got {}", self.num_x_bits);
        }
        if self.num_mix_output == 0 {
            candle_core::bail!("num_mix_output must be at least 1");
        }
        let spatial_scaling = 1usize << (self.num_preprocess_blocks + self.num_latent_scales - 1);
        if self.sample_length % spatial_scaling != 0 || self.sample_length < spatial_scaling {
            candle_core::bail!(
                "sample_length {} must be a positive multiple of the spatial scaling {}",
                self.sample_length,
                spatial_scaling
            );
        }
        self.arch.validate().map_err(candle_core::Error::Msg)?;
        Ok(())
    }

    /// Latent groups per scale, finest scale first.
    ///
    /// With `ada_groups` the count halves at every coarser scale, floored at
    /// `min_groups_per_scale`.
    pub fn groups_per_scale(&self) -> Vec<usize> {
        let mut groups = Vec::with_capacity(self.num_latent_scales);
        let mut n = self.num_groups_per_scale;
        for _ in 0..self.num_latent_scales {
            groups.push(n.max(self.min_groups_per_scale));
            if self.ada_groups {
                n = (n / 2).max(self.min_groups_per_scale);
            }
        }
        groups
    }

    /// A single scale with a single group degenerates to a vanilla VAE.
    pub fn is_vanilla_vae(&self) -> bool {
        self.num_latent_scales == 1 && self.num_groups_per_scale == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ModelConfig::default().validate().unwrap();
    }

    #[test]
    fn from_json_overrides_fields() {
        let config =
            ModelConfig::from_json(r#"{"num_latent_scales": 2, "sample_length": 512}"#).unwrap();
        assert_eq!(config.num_latent_scales, 2);
        assert_eq!(config.sample_length, 512);
        // untouched fields keep defaults
        assert_eq!(config.num_latent_per_group, 20);
    }

    #[test]
    fn adaptive_groups_halve_with_floor() {
        let config = ModelConfig {
            num_latent_scales: 3,
            num_groups_per_scale: 4,
            min_groups_per_scale: 1,
            ada_groups: true,
            sample_length: 2048,
            ..Default::default()
        };
        assert_eq!(config.groups_per_scale(), vec![4, 2, 1]);

        let floored = ModelConfig {
            min_groups_per_scale: 2,
            ..config
        };
        assert_eq!(floored.groups_per_scale(), vec![4, 2, 2]);
    }

    #[test]
    fn rejects_unaligned_sample_length() {
        // 3 scales + 1 pre-process block need a multiple of 8
        let config = ModelConfig {
            sample_length: 1001,
            num_latent_scales: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let aligned = ModelConfig {
            sample_length: 1000,
            ..config
        };
        assert!(aligned.validate().is_ok());
    }
}
