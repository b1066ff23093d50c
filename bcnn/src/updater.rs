//! Adversarial updater for conditional image translation.
//!
//! One call to [`GanUpdater::update`] performs a discriminator step followed
//! by a generator step on the same mini-batch. The generator objective is the
//! adversarial term plus `alpha` times the L1 distance to the target.

use std::collections::BTreeMap;

use burn::{
    optim::{AdamConfig, GradientsParams, Optimizer, decay::WeightDecayConfig},
    prelude::*,
    tensor::{activation::softplus, backend::AutodiffBackend, ElementConversion},
};

use crate::{
    config::GanLoss,
    data::PairBatch,
    models::{PatchDiscriminator, Regressor},
};

/// Scalar values reported during one iteration, keyed by name.
pub type Observation = BTreeMap<String, f64>;

/// Adam configured the way both networks are trained.
///
/// `decay <= 0` disables weight decay.
pub fn adam(beta_1: f32, decay: f32) -> AdamConfig {
    let config = AdamConfig::new().with_beta_1(beta_1).with_beta_2(0.999);
    if decay > 0.0 {
        config.with_weight_decay(Some(WeightDecayConfig::new(decay)))
    } else {
        config
    }
}

impl GanLoss {
    /// Discriminator objective from the logits of real and generated pairs.
    pub fn discriminator<B: Backend>(&self, real: Tensor<B, 4>, fake: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            Self::Dcgan => softplus(real.neg(), 1.0).mean() + softplus(fake, 1.0).mean(),
            Self::Lsgan => {
                (real.sub_scalar(1.0).powf_scalar(2.0).mean() + fake.powf_scalar(2.0).mean())
                    .mul_scalar(0.5)
            }
        }
    }

    /// Adversarial part of the generator objective from the logits of generated pairs.
    pub fn generator<B: Backend>(&self, fake: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            Self::Dcgan => softplus(fake.neg(), 1.0).mean(),
            Self::Lsgan => fake.sub_scalar(1.0).powf_scalar(2.0).mean().mul_scalar(0.5),
        }
    }
}

fn scalar<B: Backend>(x: &Tensor<B, 1>) -> f64 {
    x.clone().into_scalar().elem::<f64>()
}

/// Owns both networks and their optimizers.
pub struct GanUpdater<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    generator: Regressor<B>,
    discriminator: PatchDiscriminator<B>,
    optim_gen: OG,
    optim_dis: OD,
    gan_loss: GanLoss,
    alpha: f64,
    lr_gen: f64,
    lr_dis: f64,
}

impl<B, OG, OD> GanUpdater<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    /// Creates an updater where both optimizers start at `lr`.
    pub fn new(
        generator: Regressor<B>,
        discriminator: PatchDiscriminator<B>,
        optimizers: (OG, OD),
        gan_loss: GanLoss,
        alpha: f64,
        lr: f64,
    ) -> Self {
        let (optim_gen, optim_dis) = optimizers;
        Self {
            generator,
            discriminator,
            optim_gen,
            optim_dis,
            gan_loss,
            alpha,
            lr_gen: lr,
            lr_dis: lr,
        }
    }

    /// Runs one discriminator step and one generator step on `batch`.
    ///
    /// Reports `loss_dis`, `loss_gen` and `loss_cond`.
    pub fn update(&mut self, batch: PairBatch<B>) -> Observation {
        let PairBatch { x, t } = batch;

        let y = self.generator.forward(x.clone());

        let real = self.discriminator.forward_pair(x.clone(), t.clone());
        let fake = self.discriminator.forward_pair(x.clone(), y.clone().detach());
        let loss_dis = self.gan_loss.discriminator(real, fake);
        let grads = GradientsParams::from_grads(loss_dis.backward(), &self.discriminator);
        self.discriminator = self
            .optim_dis
            .step(self.lr_dis, self.discriminator.clone(), grads);

        let fake = self.discriminator.forward_pair(x, y.clone());
        let loss_adv = self.gan_loss.generator(fake);
        let loss_cond = self.generator.loss(y, t);
        let loss_gen = loss_adv + loss_cond.clone().mul_scalar(self.alpha);
        let grads = GradientsParams::from_grads(loss_gen.backward(), &self.generator);
        self.generator = self
            .optim_gen
            .step(self.lr_gen, self.generator.clone(), grads);

        let mut observation = Observation::new();
        observation.insert("loss_dis".to_string(), scalar(&loss_dis));
        observation.insert("loss_gen".to_string(), scalar(&loss_gen));
        observation.insert("loss_cond".to_string(), scalar(&loss_cond));
        observation
    }

    /// The generator with its output activation.
    pub const fn generator(&self) -> &Regressor<B> {
        &self.generator
    }

    /// The discriminator.
    pub const fn discriminator(&self) -> &PatchDiscriminator<B> {
        &self.discriminator
    }

    /// Generator optimizer.
    pub const fn optim_gen(&self) -> &OG {
        &self.optim_gen
    }

    /// Discriminator optimizer.
    pub const fn optim_dis(&self) -> &OD {
        &self.optim_dis
    }

    /// Replaces both networks, e.g. after loading a snapshot.
    pub fn load_models(&mut self, generator: Regressor<B>, discriminator: PatchDiscriminator<B>) {
        self.generator = generator;
        self.discriminator = discriminator;
    }

    /// Replaces both optimizer states.
    pub fn load_optimizers(&mut self, optim_gen: OG, optim_dis: OD) {
        self.optim_gen = optim_gen;
        self.optim_dis = optim_dis;
    }

    /// Current learning rates `(generator, discriminator)`.
    pub const fn learning_rates(&self) -> (f64, f64) {
        (self.lr_gen, self.lr_dis)
    }

    /// Sets the learning rate of both optimizers.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr_gen = lr;
        self.lr_dis = lr;
    }

    /// The adversarial objective.
    pub const fn gan_loss(&self) -> &GanLoss {
        &self.gan_loss
    }
}
