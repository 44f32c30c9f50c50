//! Hierarchical autoencoder over 1-D signals.
//!
//! The encoder tower runs bottom-up once, caching the feature stream at every
//! combiner position; the decoder tower then runs top-down, pairing each
//! cached stream with the matching combiner in reverse order, sampling one
//! latent group per combiner.

pub mod loss;

pub use loss::LossSchedule;

use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, Module, ModuleT, VarBuilder};
use tracing::debug;

use crate::config::{ModelConfig, CHANNEL_MULT};
use crate::nn::regularizer::{self, LayerRegistry, SpectralState};
use crate::nn::{
    Cell, CellRole, DecCombiner, DiscMixLogistic, EncCombiner, FlowTransformKind, Normal,
    PairedFlowCell, WeightNormConv1d,
};

/// Width multiplier of the flow-cell channel check relative to the latent.
const FLOW_CHANNEL_MULT: usize = 8;

/// One step of the encoder tower.
#[derive(Debug)]
enum EncStep {
    Cell(Cell),
    Combiner(EncCombiner),
}

/// One step of the decoder tower.
#[derive(Debug)]
enum DecStep {
    Cell(Cell),
    Combiner(DecCombiner),
}

/// Channel reduction ahead of the first posterior sampler.
#[derive(Debug)]
struct Enc0 {
    conv: WeightNormConv1d,
}

impl Module for Enc0 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(&xs.elu(1.0)?)?.elu(1.0)
    }
}

/// Projects a decoder stream to prior mean/log-scale parameters.
#[derive(Debug)]
struct DecSampler {
    conv: WeightNormConv1d,
}

impl Module for DecSampler {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(&xs.elu(1.0)?)
    }
}

/// Projects the final decoder stream to the output mixture parameters.
#[derive(Debug)]
struct OutputHead {
    conv: WeightNormConv1d,
}

impl Module for OutputHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(&xs.elu(1.0)?)
    }
}

/// Host-side scalars reported by a forward pass.
#[derive(Debug, Clone)]
pub struct ForwardMetrics {
    pub recon_loss: f64,
    pub bn_loss: f64,
    pub norm_loss: f64,
    pub wdn_coeff: f64,
    pub kl_total: f64,
    pub kl_coeff: f64,
    /// Mean KL per latent group, decode order.
    pub kl_groups: Vec<f64>,
}

impl ForwardMetrics {
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("recon_loss", self.recon_loss),
            ("bn_loss", self.bn_loss),
            ("norm_loss", self.norm_loss),
            ("wdn_coeff", self.wdn_coeff),
            ("kl_total", self.kl_total),
            ("kl_coeff", self.kl_coeff),
        ]
    }
}

/// Hierarchical VAE with weight-normalized towers and a discretized
/// mixture-of-logistics output.
#[derive(Debug)]
pub struct Autoencoder {
    config: ModelConfig,
    groups_per_scale: Vec<usize>,
    vanilla_vae: bool,

    stem: WeightNormConv1d,
    pre_process: Vec<Cell>,
    enc_tower: Vec<EncStep>,
    enc0: Enc0,
    enc_sampler: Vec<WeightNormConv1d>,
    dec_sampler: Vec<DecSampler>,
    nf_cells: Vec<PairedFlowCell>,
    dec_tower: Vec<DecStep>,
    stem_decoder: Option<WeightNormConv1d>,
    post_process: Vec<Cell>,
    output_head: OutputHead,

    /// Learned constant feeding the top of the decoder tower.
    prior_ftr0: Tensor,
    z0_spatial: usize,

    registry: LayerRegistry,
    spectral: SpectralState,
}

impl Autoencoder {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let groups_per_scale = config.groups_per_scale();
        let vanilla_vae = config.is_vanilla_vae();
        let num_scales = config.num_latent_scales;
        let mut registry = LayerRegistry::default();

        let stem = WeightNormConv1d::new(
            1,
            config.num_channels_enc,
            3,
            1,
            1,
            true,
            vb.pp("stem"),
            &mut registry,
        )?;

        // pre-process blocks, each ending in a downsampling cell
        let mut mult = 1usize;
        let mut pre_process = Vec::new();
        for b in 0..config.num_preprocess_blocks {
            for c in 0..config.num_preprocess_cells {
                let vb = vb.pp(format!("pre_{b}_{c}"));
                if c == config.num_preprocess_cells - 1 {
                    let ci = config.num_channels_enc * mult;
                    pre_process.push(Cell::new(
                        ci,
                        CHANNEL_MULT * ci,
                        CellRole::DownPre,
                        &config.arch.down_pre,
                        config.use_se,
                        vb,
                        &mut registry,
                    )?);
                    mult *= CHANNEL_MULT;
                } else {
                    let ci = config.num_channels_enc * mult;
                    pre_process.push(Cell::new(
                        ci,
                        ci,
                        CellRole::NormalPre,
                        &config.arch.normal_pre,
                        config.use_se,
                        vb,
                        &mut registry,
                    )?);
                }
            }
        }

        // encoder tower, finest scale first
        let mut enc_tower = Vec::new();
        if !vanilla_vae {
            for s in 0..num_scales {
                for g in 0..groups_per_scale[s] {
                    for c in 0..config.num_cell_per_cond_enc {
                        let ci = config.num_channels_enc * mult;
                        enc_tower.push(EncStep::Cell(Cell::new(
                            ci,
                            ci,
                            CellRole::NormalEnc,
                            &config.arch.normal_enc,
                            config.use_se,
                            vb.pp(format!("enc_{s}_{g}_{c}")),
                            &mut registry,
                        )?));
                    }
                    // the final group feeds enc0 directly and needs no combiner
                    if !(s == num_scales - 1 && g == groups_per_scale[s] - 1) {
                        enc_tower.push(EncStep::Combiner(EncCombiner::new(
                            config.num_channels_enc * mult,
                            config.num_channels_dec * mult,
                            vb.pp(format!("enc_comb_{s}_{g}")),
                            &mut registry,
                        )?));
                    }
                }
                if s < num_scales - 1 {
                    let ci = config.num_channels_enc * mult;
                    enc_tower.push(EncStep::Cell(Cell::new(
                        ci,
                        CHANNEL_MULT * ci,
                        CellRole::DownEnc,
                        &config.arch.down_enc,
                        config.use_se,
                        vb.pp(format!("enc_down_{s}")),
                        &mut registry,
                    )?));
                    mult *= CHANNEL_MULT;
                }
            }
        }

        let enc0_channels = config.num_channels_enc * mult;
        let enc0 = Enc0 {
            conv: WeightNormConv1d::new(
                enc0_channels,
                enc0_channels,
                1,
                0,
                1,
                true,
                vb.pp("enc0"),
                &mut registry,
            )?,
        };

        // samplers and flows, decode order (coarsest group first)
        let mut enc_sampler = Vec::new();
        let mut dec_sampler = Vec::new();
        let mut nf_cells = Vec::new();
        let mut mult_s = mult;
        for s in 0..num_scales {
            for g in 0..groups_per_scale[num_scales - s - 1] {
                let idx = enc_sampler.len();
                enc_sampler.push(WeightNormConv1d::new(
                    config.num_channels_enc * mult_s,
                    2 * config.num_latent_per_group,
                    3,
                    1,
                    1,
                    true,
                    vb.pp(format!("enc_sampler_{idx}")),
                    &mut registry,
                )?);
                for n in 0..config.num_flows {
                    nf_cells.push(PairedFlowCell::new(
                        config.num_latent_per_group,
                        config.num_channels_enc * mult_s,
                        FLOW_CHANNEL_MULT * config.num_latent_per_group,
                        &config.arch.ar_nn,
                        FlowTransformKind::Affine,
                        vb.pp(format!("nf_{idx}_{n}")),
                        &mut registry,
                    )?);
                }
                // the first group samples against the fixed standard prior
                if !(s == 0 && g == 0) {
                    dec_sampler.push(DecSampler {
                        conv: WeightNormConv1d::new(
                            config.num_channels_dec * mult_s,
                            2 * config.num_latent_per_group,
                            1,
                            0,
                            1,
                            true,
                            vb.pp(format!("dec_sampler_{idx}")),
                            &mut registry,
                        )?,
                    });
                }
            }
            mult_s /= CHANNEL_MULT;
        }

        // decoder tower, coarsest scale first
        let mut dec_tower = Vec::new();
        let mut stem_decoder = None;
        if vanilla_vae {
            stem_decoder = Some(WeightNormConv1d::new(
                config.num_latent_per_group,
                config.num_channels_dec * mult,
                1,
                0,
                1,
                true,
                vb.pp("stem_decoder"),
                &mut registry,
            )?);
        } else {
            let mut mult_d = mult;
            for s in 0..num_scales {
                for g in 0..groups_per_scale[num_scales - s - 1] {
                    let ci = config.num_channels_dec * mult_d;
                    if !(s == 0 && g == 0) {
                        for c in 0..config.num_cell_per_cond_dec {
                            dec_tower.push(DecStep::Cell(Cell::new(
                                ci,
                                ci,
                                CellRole::NormalDec,
                                &config.arch.normal_dec,
                                config.use_se,
                                vb.pp(format!("dec_{s}_{g}_{c}")),
                                &mut registry,
                            )?));
                        }
                    }
                    dec_tower.push(DecStep::Combiner(DecCombiner::new(
                        ci,
                        config.num_latent_per_group,
                        ci,
                        vb.pp(format!("dec_comb_{s}_{g}")),
                        &mut registry,
                    )?));
                }
                if s < num_scales - 1 {
                    let ci = config.num_channels_dec * mult_d;
                    dec_tower.push(DecStep::Cell(Cell::new(
                        ci,
                        ci / CHANNEL_MULT,
                        CellRole::UpDec,
                        &config.arch.up_dec,
                        config.use_se,
                        vb.pp(format!("dec_up_{s}")),
                        &mut registry,
                    )?));
                    mult_d /= CHANNEL_MULT;
                }
            }
            mult = mult_d;
        }

        // post-process blocks, each starting with an upsampling cell
        let mut post_process = Vec::new();
        for b in 0..config.num_postprocess_blocks {
            for c in 0..config.num_postprocess_cells {
                let vb = vb.pp(format!("post_{b}_{c}"));
                if c == 0 {
                    let ci = config.num_channels_dec * mult;
                    post_process.push(Cell::new(
                        ci,
                        ci / CHANNEL_MULT,
                        CellRole::UpPost,
                        &config.arch.up_post,
                        config.use_se,
                        vb,
                        &mut registry,
                    )?);
                    mult /= CHANNEL_MULT;
                } else {
                    let ci = config.num_channels_dec * mult;
                    post_process.push(Cell::new(
                        ci,
                        ci,
                        CellRole::NormalPost,
                        &config.arch.normal_post,
                        config.use_se,
                        vb,
                        &mut registry,
                    )?);
                }
            }
        }

        let output_head = OutputHead {
            conv: WeightNormConv1d::new(
                config.num_channels_dec * mult,
                3 * config.num_mix_output,
                3,
                1,
                1,
                true,
                vb.pp("output"),
                &mut registry,
            )?,
        };

        let scaling_exp = config.num_preprocess_blocks + num_scales - 1;
        let c_scaling = CHANNEL_MULT.pow(scaling_exp as u32);
        let spatial_scaling = 1usize << scaling_exp;
        let z0_spatial = config.sample_length / spatial_scaling;
        let prior_ftr0 = vb.get_with_hints(
            (c_scaling * config.num_channels_dec, z0_spatial),
            "prior_ftr0",
            Init::Uniform { lo: 0., up: 1. },
        )?;

        debug!(
            num_convs = registry.num_convs(),
            num_bns = registry.num_bns(),
            vanilla_vae,
            "built autoencoder"
        );

        Ok(Self {
            config,
            groups_per_scale,
            vanilla_vae,
            stem,
            pre_process,
            enc_tower,
            enc0,
            enc_sampler,
            dec_sampler,
            nf_cells,
            dec_tower,
            stem_decoder,
            post_process,
            output_head,
            prior_ftr0,
            z0_spatial,
            registry,
            spectral: SpectralState::default(),
        })
    }

    fn with_nf(&self) -> bool {
        self.config.num_flows > 0
    }

    /// Training pass over a `(batch, time, 1)` signal in `[-1, 1]`.
    ///
    /// Returns the output distribution, the scalar total loss and the metric
    /// scalars, and advances the persisted spectral power-iteration state.
    pub fn forward(
        &mut self,
        x: &Tensor,
        global_step: usize,
        schedule: &LossSchedule,
    ) -> Result<(DiscMixLogistic, Tensor, ForwardMetrics)> {
        let (batch, time, channels) = x.dims3()?;
        if time != self.config.sample_length || channels != 1 {
            candle_core::bail!(
                "expected input of shape (batch, {}, 1), got ({batch}, {time}, {channels})",
                self.config.sample_length
            );
        }
        let alpha = loss::kl_balancer_coeff(&self.groups_per_scale, x.device())?;
        let stream_dtype = if schedule.fp16 {
            DType::F16
        } else {
            self.prior_ftr0.dtype()
        };
        let x_in = x.transpose(1, 2)?.to_dtype(stream_dtype)?;

        let mut s = self.stem.forward(&x_in)?;
        for cell in &self.pre_process {
            s = cell.forward_t(&s, true)?;
        }

        // run the encoder tower, deferring every combiner
        let mut combiners = Vec::new();
        let mut combiner_inputs = Vec::new();
        for step in &self.enc_tower {
            match step {
                EncStep::Cell(cell) => s = cell.forward_t(&s, true)?,
                EncStep::Combiner(comb) => {
                    combiners.push(comb);
                    combiner_inputs.push(s.clone());
                }
            }
        }
        // the decoder consumes the cache top-down
        combiners.reverse();
        combiner_inputs.reverse();

        // first posterior, sampled from the reduced encoder output
        let mut ftr = self.enc0.forward(&s)?;
        let params = self.enc_sampler[0].forward(&ftr)?.chunk(2, 1)?;
        let q = Normal::new(params[0].clone(), params[1].clone())?;
        let mut z = q.sample()?;
        let mut log_q = q.log_p(&z)?;
        let mut nf_offset = 0;
        for n in 0..self.config.num_flows {
            let (new_z, log_det) = self.nf_cells[nf_offset + n].forward(&z, &ftr)?;
            z = new_z;
            log_q = log_q.sub(&log_det)?;
        }
        nf_offset += self.config.num_flows;

        let p = Normal::standard(z.dims(), z.dtype(), z.device())?;
        let mut all_q = vec![q];
        let mut all_p = vec![p];
        let mut all_log_q = vec![log_q];
        let mut all_log_p = vec![all_p[0].log_p(&z)?];

        // decoder tower seeded from the learned constant
        let (c0, l0) = self.prior_ftr0.dims2()?;
        let mut s = self
            .prior_ftr0
            .to_dtype(stream_dtype)?
            .unsqueeze(0)?
            .expand((batch, c0, l0))?
            .contiguous()?;
        let mut idx_dec = 0usize;
        for step in &self.dec_tower {
            match step {
                DecStep::Cell(cell) => s = cell.forward_t(&s, true)?,
                DecStep::Combiner(comb) => {
                    if idx_dec > 0 {
                        let prior = self.dec_sampler[idx_dec - 1].forward(&s)?.chunk(2, 1)?;
                        ftr = combiners[idx_dec - 1].forward(&combiner_inputs[idx_dec - 1], &s)?;
                        let post = self.enc_sampler[idx_dec].forward(&ftr)?.chunk(2, 1)?;
                        let q = if self.config.res_dist {
                            Normal::new(
                                (&prior[0] + &post[0])?,
                                (&prior[1] + &post[1])?,
                            )?
                        } else {
                            Normal::new(post[0].clone(), post[1].clone())?
                        };
                        z = q.sample()?;
                        let mut log_q = q.log_p(&z)?;
                        for n in 0..self.config.num_flows {
                            let (new_z, log_det) =
                                self.nf_cells[nf_offset + n].forward(&z, &ftr)?;
                            z = new_z;
                            log_q = log_q.sub(&log_det)?;
                        }
                        nf_offset += self.config.num_flows;

                        let p = Normal::new(prior[0].clone(), prior[1].clone())?;
                        all_log_p.push(p.log_p(&z)?);
                        all_log_q.push(log_q);
                        all_q.push(q);
                        all_p.push(p);
                    }
                    s = comb.forward(&s, &z)?;
                    idx_dec += 1;
                }
            }
        }

        if let Some(stem_decoder) = &self.stem_decoder {
            s = stem_decoder.forward(&z)?;
        }
        for cell in &self.post_process {
            s = cell.forward_t(&s, true)?;
        }
        let logits = self.output_head.forward(&s.to_dtype(DType::F32)?)?;
        let output = DiscMixLogistic::new(&logits, self.config.num_x_bits)?;

        // per-group KL, closed form unless flows reshaped the posterior
        let mut kl_all = Vec::with_capacity(all_q.len());
        for (i, (q, p)) in all_q.iter().zip(all_p.iter()).enumerate() {
            let kl_per_var = if self.with_nf() {
                all_log_q[i].sub(&all_log_p[i])?
            } else {
                q.kl(p)?
            };
            kl_all.push(kl_per_var.sum((1, 2))?.to_dtype(DType::F32)?);
        }

        let kl_coeff = schedule.kl_coeff(global_step);
        let recon = loss::reconstruction_loss(&output, &x_in.to_dtype(DType::F32)?)?;
        let (balanced_kl, _kl_coeffs, kl_vals) =
            loss::kl_balancer(&kl_all, kl_coeff, true, Some(&alpha))?;
        let nelbo = (recon.clone() + balanced_kl)?;

        let norm_loss = regularizer::spectral_loss(&self.registry, &mut self.spectral)?;
        let bn_loss = regularizer::batchnorm_loss(&self.registry)?;
        let wdn_coeff = schedule.weight_decay_coeff(kl_coeff)?;
        let total = (nelbo.mean_all()? + ((&norm_loss + &bn_loss)? * wdn_coeff)?)?;

        let kl_total = Tensor::stack(&kl_all, 1)?
            .sum(1)?
            .mean_all()?
            .to_scalar::<f32>()? as f64;
        let metrics = ForwardMetrics {
            recon_loss: recon.mean_all()?.to_scalar::<f32>()? as f64,
            bn_loss: bn_loss.to_scalar::<f32>()? as f64,
            norm_loss: norm_loss.to_scalar::<f32>()? as f64,
            wdn_coeff,
            kl_total,
            kl_coeff,
            kl_groups: kl_vals
                .to_vec1::<f32>()?
                .into_iter()
                .map(f64::from)
                .collect(),
        };
        debug!(
            global_step,
            recon = metrics.recon_loss,
            kl = metrics.kl_total,
            kl_coeff,
            wdn_coeff,
            "forward"
        );
        Ok((output, total, metrics))
    }

    /// Decode-only pass sampling every latent group from its prior.
    ///
    /// Returns `(num_samples, sample_length, 1)` signals in `[-1, 1]`; with
    /// temperature 0 the pass is fully deterministic.
    pub fn generate(&self, num_samples: usize, temperature: f64) -> Result<Tensor> {
        let dtype = self.prior_ftr0.dtype();
        let device = self.prior_ftr0.device();
        let z0 = Normal::with_temperature(
            Tensor::zeros(
                (num_samples, self.config.num_latent_per_group, self.z0_spatial),
                dtype,
                device,
            )?,
            Tensor::zeros(
                (num_samples, self.config.num_latent_per_group, self.z0_spatial),
                dtype,
                device,
            )?,
            temperature,
        )?;
        let mut z = z0.sample()?;

        let (c0, l0) = self.prior_ftr0.dims2()?;
        let mut s = self
            .prior_ftr0
            .unsqueeze(0)?
            .expand((num_samples, c0, l0))?
            .contiguous()?;
        let mut idx_dec = 0usize;
        for step in &self.dec_tower {
            match step {
                DecStep::Cell(cell) => s = cell.forward_t(&s, false)?,
                DecStep::Combiner(comb) => {
                    if idx_dec > 0 {
                        let prior = self.dec_sampler[idx_dec - 1].forward(&s)?.chunk(2, 1)?;
                        let p = Normal::with_temperature(
                            prior[0].clone(),
                            prior[1].clone(),
                            temperature,
                        )?;
                        z = p.sample()?;
                    }
                    s = comb.forward(&s, &z)?;
                    idx_dec += 1;
                }
            }
        }
        if let Some(stem_decoder) = &self.stem_decoder {
            s = stem_decoder.forward(&z)?;
        }
        for cell in &self.post_process {
            s = cell.forward_t(&s, false)?;
        }
        let logits = self.output_head.forward(&s.to_dtype(DType::F32)?)?;
        let output = DiscMixLogistic::new(&logits, self.config.num_x_bits)?;
        output.sample(temperature)?.transpose(1, 2)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_registered_convs(&self) -> usize {
        self.registry.num_convs()
    }
}
