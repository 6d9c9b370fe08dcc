/// Image augmentation pipeline
///
/// Training composition: RandomResizedCrop -> HFlip -> VFlip -> RandAugment
/// -> ColorJitter -> normalize -> RandomErasing. Evaluation uses the
/// normalize stage only.
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::Rng;

use super::{CIFAR_MEAN, CIFAR_STD};
use crate::data::cifar::{IMAGE_BYTES, IMAGE_DIM};

/// Augmentation knobs for the training pipeline
#[derive(Debug, Clone, Copy)]
pub struct AugmentConfig {
    /// Horizontal flip probability
    pub hflip: f64,
    /// Vertical flip probability
    pub vflip: f64,
    /// Lower bound of the random-resized-crop area fraction
    pub scale: f64,
    /// Toggle random augmentation
    pub rand_aug: bool,
    /// Number of random augmentation operations per image
    pub ra_n: usize,
    /// Magnitude of random augmentation operations, on the usual 0..30 scale
    pub ra_m: f64,
    /// Color jitter strength
    pub jitter: f64,
    /// Random erase probability
    pub erase: f64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            hflip: 0.5,
            vflip: 0.0,
            scale: 1.0,
            rand_aug: false,
            ra_n: 0,
            ra_m: 0.0,
            jitter: 0.1,
            erase: 0.25,
        }
    }
}

/// One stochastic pixel-space stage of the pipeline
#[derive(Debug, Clone, Copy)]
enum Stage {
    ResizedCrop { scale_min: f64 },
    HorizontalFlip { p: f64 },
    VerticalFlip { p: f64 },
    RandAugment { n: usize, m: f64 },
    ColorJitter { strength: f64 },
}

/// Ordered transform composition ending in normalization (and optionally
/// random erasing on the normalized values)
pub struct TransformPipeline {
    stages: Vec<Stage>,
    erase: f64,
}

impl TransformPipeline {
    /// Stochastic training pipeline, staged in the conventional order
    pub fn train(cfg: &AugmentConfig) -> Self {
        let mut stages = vec![Stage::ResizedCrop { scale_min: cfg.scale }];
        if cfg.hflip > 0.0 {
            stages.push(Stage::HorizontalFlip { p: cfg.hflip });
        }
        if cfg.vflip > 0.0 {
            stages.push(Stage::VerticalFlip { p: cfg.vflip });
        }
        if cfg.rand_aug && cfg.ra_n > 0 {
            stages.push(Stage::RandAugment { n: cfg.ra_n, m: cfg.ra_m });
        }
        if cfg.jitter > 0.0 {
            stages.push(Stage::ColorJitter { strength: cfg.jitter });
        }
        Self { stages, erase: cfg.erase }
    }

    /// Deterministic evaluation pipeline: normalize only
    pub fn eval() -> Self {
        Self { stages: Vec::new(), erase: 0.0 }
    }

    /// Apply the pipeline to one CHW-planar byte image, producing normalized
    /// CHW f32 values.
    pub fn apply<R: Rng>(&self, chw: &[u8], rng: &mut R) -> Vec<f32> {
        let mut img = chw_to_image(chw);

        for stage in &self.stages {
            img = match *stage {
                Stage::ResizedCrop { scale_min } => random_resized_crop(&img, scale_min, rng),
                Stage::HorizontalFlip { p } => {
                    if rng.gen::<f64>() < p {
                        imageops::flip_horizontal(&img)
                    } else {
                        img
                    }
                }
                Stage::VerticalFlip { p } => {
                    if rng.gen::<f64>() < p {
                        imageops::flip_vertical(&img)
                    } else {
                        img
                    }
                }
                Stage::RandAugment { n, m } => rand_augment(img, n, m, rng),
                Stage::ColorJitter { strength } => color_jitter(&img, strength, rng),
            };
        }

        let mut values = normalize(&img);
        if self.erase > 0.0 && rng.gen::<f64>() < self.erase {
            random_erase(&mut values, rng);
        }
        values
    }
}

fn chw_to_image(chw: &[u8]) -> RgbImage {
    debug_assert_eq!(chw.len(), IMAGE_BYTES);
    let plane = IMAGE_DIM * IMAGE_DIM;
    RgbImage::from_fn(IMAGE_DIM as u32, IMAGE_DIM as u32, |x, y| {
        let offset = y as usize * IMAGE_DIM + x as usize;
        Rgb([chw[offset], chw[plane + offset], chw[2 * plane + offset]])
    })
}

/// HWC bytes -> normalized CHW f32
fn normalize(img: &RgbImage) -> Vec<f32> {
    let mut out = vec![0.0f32; IMAGE_BYTES];
    let plane = IMAGE_DIM * IMAGE_DIM;
    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * IMAGE_DIM + x as usize;
        for c in 0..3 {
            let v = pixel.0[c] as f32 / 255.0;
            out[c * plane + offset] = (v - CIFAR_MEAN[c]) / CIFAR_STD[c];
        }
    }
    out
}

/// Square random-resized crop with area fraction in [scale_min, 1.0],
/// resized back to the native resolution with bilinear interpolation.
fn random_resized_crop<R: Rng>(img: &RgbImage, scale_min: f64, rng: &mut R) -> RgbImage {
    let area_frac = if scale_min >= 1.0 {
        1.0
    } else {
        rng.gen_range(scale_min..=1.0)
    };
    let side = ((area_frac.sqrt() * IMAGE_DIM as f64).round() as u32).clamp(1, IMAGE_DIM as u32);
    if side == IMAGE_DIM as u32 {
        return img.clone();
    }
    let max_offset = IMAGE_DIM as u32 - side;
    let x0 = rng.gen_range(0..=max_offset);
    let y0 = rng.gen_range(0..=max_offset);
    let cropped = imageops::crop_imm(img, x0, y0, side, side).to_image();
    imageops::resize(&cropped, IMAGE_DIM as u32, IMAGE_DIM as u32, FilterType::Triangle)
}

/// The random-augmentation operation pool
#[derive(Debug, Clone, Copy)]
enum RandAugmentOp {
    Identity,
    AutoContrast,
    Posterize,
    Solarize,
    Brightness,
    Contrast,
    Saturation,
}

const RAND_AUGMENT_OPS: [RandAugmentOp; 7] = [
    RandAugmentOp::Identity,
    RandAugmentOp::AutoContrast,
    RandAugmentOp::Posterize,
    RandAugmentOp::Solarize,
    RandAugmentOp::Brightness,
    RandAugmentOp::Contrast,
    RandAugmentOp::Saturation,
];

fn rand_augment<R: Rng>(mut img: RgbImage, n: usize, m: f64, rng: &mut R) -> RgbImage {
    let frac = (m / 30.0).clamp(0.0, 1.0);
    for _ in 0..n {
        let op = RAND_AUGMENT_OPS[rng.gen_range(0..RAND_AUGMENT_OPS.len())];
        // signed magnitude where the op is directional
        let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
        img = match op {
            RandAugmentOp::Identity => img,
            RandAugmentOp::AutoContrast => auto_contrast(&img),
            RandAugmentOp::Posterize => {
                let bits = 8 - (frac * 4.0).round() as u8;
                posterize(&img, bits)
            }
            RandAugmentOp::Solarize => {
                let threshold = 255 - (frac * 255.0).round() as i32;
                solarize(&img, threshold.clamp(0, 255) as u8)
            }
            RandAugmentOp::Brightness => scale_brightness(&img, 1.0 + sign * frac * 0.9),
            RandAugmentOp::Contrast => scale_contrast(&img, 1.0 + sign * frac * 0.9),
            RandAugmentOp::Saturation => scale_saturation(&img, 1.0 + sign * frac * 0.9),
        };
    }
    img
}

/// Brightness/contrast/saturation each jittered by a factor drawn from
/// [1 - strength, 1 + strength].
fn color_jitter<R: Rng>(img: &RgbImage, strength: f64, rng: &mut R) -> RgbImage {
    let draw = |rng: &mut R| -> f64 {
        let lo = (1.0 - strength).max(0.0);
        rng.gen_range(lo..=1.0 + strength)
    };
    let out = scale_brightness(img, draw(rng));
    let out = scale_contrast(&out, draw(rng));
    scale_saturation(&out, draw(rng))
}

fn map_pixels(img: &RgbImage, f: impl Fn(&[u8; 3]) -> [f64; 3]) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let mapped = f(&img.get_pixel(x, y).0);
        Rgb([
            mapped[0].round().clamp(0.0, 255.0) as u8,
            mapped[1].round().clamp(0.0, 255.0) as u8,
            mapped[2].round().clamp(0.0, 255.0) as u8,
        ])
    })
}

fn scale_brightness(img: &RgbImage, factor: f64) -> RgbImage {
    map_pixels(img, |p| [p[0] as f64 * factor, p[1] as f64 * factor, p[2] as f64 * factor])
}

fn scale_contrast(img: &RgbImage, factor: f64) -> RgbImage {
    let n = (img.width() * img.height()) as f64;
    let mean = img
        .pixels()
        .map(|p| luma(&p.0))
        .sum::<f64>()
        / n;
    map_pixels(img, |p| {
        [
            mean + (p[0] as f64 - mean) * factor,
            mean + (p[1] as f64 - mean) * factor,
            mean + (p[2] as f64 - mean) * factor,
        ]
    })
}

fn scale_saturation(img: &RgbImage, factor: f64) -> RgbImage {
    map_pixels(img, |p| {
        let gray = luma(p);
        [
            gray + (p[0] as f64 - gray) * factor,
            gray + (p[1] as f64 - gray) * factor,
            gray + (p[2] as f64 - gray) * factor,
        ]
    })
}

fn luma(p: &[u8; 3]) -> f64 {
    0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64
}

/// Per-channel min/max stretch to the full byte range
fn auto_contrast(img: &RgbImage) -> RgbImage {
    let mut lo = [255u8; 3];
    let mut hi = [0u8; 3];
    for p in img.pixels() {
        for c in 0..3 {
            lo[c] = lo[c].min(p.0[c]);
            hi[c] = hi[c].max(p.0[c]);
        }
    }
    map_pixels(img, |p| {
        let mut out = [0.0f64; 3];
        for c in 0..3 {
            out[c] = if hi[c] > lo[c] {
                (p[c] - lo[c]) as f64 * 255.0 / (hi[c] - lo[c]) as f64
            } else {
                p[c] as f64
            };
        }
        out
    })
}

fn posterize(img: &RgbImage, bits: u8) -> RgbImage {
    let mask = !0u8 << (8 - bits.clamp(1, 8));
    map_pixels(img, |p| [(p[0] & mask) as f64, (p[1] & mask) as f64, (p[2] & mask) as f64])
}

fn solarize(img: &RgbImage, threshold: u8) -> RgbImage {
    map_pixels(img, |p| {
        let mut out = [0.0f64; 3];
        for c in 0..3 {
            out[c] = if p[c] >= threshold { (255 - p[c]) as f64 } else { p[c] as f64 };
        }
        out
    })
}

/// Zero a random rectangle of the normalized image, with the usual area and
/// aspect-ratio ranges. Up to ten placement attempts; gives up silently if
/// none fits.
fn random_erase<R: Rng>(values: &mut [f32], rng: &mut R) {
    let plane = IMAGE_DIM * IMAGE_DIM;
    for _ in 0..10 {
        let area = rng.gen_range(0.02..=0.33) * plane as f64;
        let log_ratio = rng.gen_range((0.3f64).ln()..=(3.3f64).ln());
        let ratio = log_ratio.exp();
        let h = (area * ratio).sqrt().round() as usize;
        let w = (area / ratio).sqrt().round() as usize;
        if h == 0 || w == 0 || h > IMAGE_DIM || w > IMAGE_DIM {
            continue;
        }
        let y0 = rng.gen_range(0..=IMAGE_DIM - h);
        let x0 = rng.gen_range(0..=IMAGE_DIM - w);
        for c in 0..3 {
            for y in y0..y0 + h {
                for x in x0..x0 + w {
                    values[c * plane + y * IMAGE_DIM + x] = 0.0;
                }
            }
        }
        return;
    }
}
