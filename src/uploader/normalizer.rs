// 图片压缩（上传前规范化）
//
// 规则：
// - 非图片：原样返回
// - 文件已经足够小（<= max_output_bytes 的 50%）：原样返回
// - 否则解码 -> 等比缩放 -> 按 quality 重新编码
// - 目标编码器不可用时回退到 JPEG
// - 任何解码/编码错误都回退到原始文件，绝不阻塞上传
//
// 渐进式压缩：第一次编码后仍超过 max_output_bytes 时，
// 依次降低质量（0.6）、再降低质量并缩小尺寸（0.5, 1600px）

use crate::error::NormalizationError;
use crate::uploader::asset::{format_bytes, Asset};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Instant;
use tracing::{debug, warn};

/// 小文件跳过阈值（相对 max_output_bytes 的比例）
const SKIP_RATIO: f64 = 0.5;

/// 渐进式压缩第二阶段质量上限
const SECOND_STAGE_QUALITY: f32 = 0.6;
/// 渐进式压缩第三阶段质量上限
const FINAL_STAGE_QUALITY: f32 = 0.5;
/// 渐进式压缩第三阶段尺寸上限
const FINAL_STAGE_MAX_DIMENSION: u32 = 1600;

/// 目标编码格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    Jpeg,
    Png,
    Webp,
}

impl TargetFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            TargetFormat::Jpeg => "image/jpeg",
            TargetFormat::Png => "image/png",
            TargetFormat::Webp => "image/webp",
        }
    }

    fn output_format(&self, quality: f32) -> ImageOutputFormat {
        match self {
            TargetFormat::Jpeg => ImageOutputFormat::Jpeg(jpeg_quality(quality)),
            TargetFormat::Png => ImageOutputFormat::Png,
            // 是否支持取决于 image 的编译特性，不支持时 write_to 返回 Unsupported
            TargetFormat::Webp => ImageOutputFormat::from(ImageFormat::WebP),
        }
    }
}

/// 压缩约束
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizeConstraints {
    /// 最大宽度（像素）
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    /// 最大高度（像素）
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    /// 编码质量 0-1
    #[serde(default = "default_quality")]
    pub quality: f32,
    /// 目标格式
    #[serde(default)]
    pub target_format: TargetFormat,
    /// 期望的最大输出大小（字节）
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    /// 是否启用渐进式压缩
    #[serde(default = "default_progressive")]
    pub progressive: bool,
}

fn default_max_dimension() -> u32 {
    1920
}

fn default_quality() -> f32 {
    0.8
}

fn default_max_output_bytes() -> u64 {
    2 * 1024 * 1024 // 2MB
}

fn default_progressive() -> bool {
    true
}

impl Default for NormalizeConstraints {
    fn default() -> Self {
        Self {
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            quality: default_quality(),
            target_format: TargetFormat::default(),
            max_output_bytes: default_max_output_bytes(),
            progressive: default_progressive(),
        }
    }
}

impl NormalizeConstraints {
    /// 小于等于该大小的文件直接跳过压缩
    pub fn skip_threshold(&self) -> u64 {
        (self.max_output_bytes as f64 * SKIP_RATIO) as u64
    }

    fn stages(&self) -> Vec<EncodeStage> {
        let first = EncodeStage {
            quality: self.quality,
            max_width: self.max_width,
            max_height: self.max_height,
        };
        if !self.progressive {
            return vec![first];
        }
        vec![
            first,
            EncodeStage {
                quality: self.quality.min(SECOND_STAGE_QUALITY),
                ..first
            },
            EncodeStage {
                quality: self.quality.min(FINAL_STAGE_QUALITY),
                max_width: self.max_width.min(FINAL_STAGE_MAX_DIMENSION),
                max_height: self.max_height.min(FINAL_STAGE_MAX_DIMENSION),
            },
        ]
    }
}

#[derive(Debug, Clone, Copy)]
struct EncodeStage {
    quality: f32,
    max_width: u32,
    max_height: u32,
}

/// 未压缩的原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassReason {
    /// 不是图片
    NotImage,
    /// 已经足够小
    AlreadySmall,
}

/// 压缩结果类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizeOutcome {
    /// 原样通过
    PassThrough { reason: PassReason },
    /// 重新编码
    Reencoded {
        format: TargetFormat,
        width: u32,
        height: u32,
        stages: u8,
    },
    /// 出错，回退到原始文件
    Fallback { error: String },
}

/// 压缩报告（遥测用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizationReport {
    pub original_size: u64,
    pub output_size: u64,
    /// output_size / original_size
    pub ratio: f64,
    pub outcome: NormalizeOutcome,
    pub elapsed_ms: u64,
}

impl NormalizationReport {
    fn new(original_size: u64, output_size: u64, outcome: NormalizeOutcome, started: Instant) -> Self {
        let ratio = if original_size == 0 {
            1.0
        } else {
            output_size as f64 / original_size as f64
        };
        Self {
            original_size,
            output_size,
            ratio,
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// 是否回退（压缩出错）
    pub fn is_fault(&self) -> bool {
        matches!(self.outcome, NormalizeOutcome::Fallback { .. })
    }
}

/// 压缩后的资源
#[derive(Debug, Clone)]
pub struct NormalizedAsset {
    pub asset: Asset,
    pub report: NormalizationReport,
}

/// 图片压缩器（无状态）
#[derive(Debug, Clone, Default)]
pub struct AssetNormalizer {
    constraints: NormalizeConstraints,
}

impl AssetNormalizer {
    pub fn new(constraints: NormalizeConstraints) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &NormalizeConstraints {
        &self.constraints
    }

    /// 压缩单个资源，不会失败
    pub fn normalize(&self, asset: &Asset) -> NormalizedAsset {
        let started = Instant::now();
        let original_size = asset.size();

        if !asset.is_image() {
            return Self::pass_through(asset, PassReason::NotImage, started);
        }

        if original_size <= self.constraints.skip_threshold() {
            debug!(
                "文件已足够小，跳过压缩: {} ({})",
                asset.name,
                format_bytes(original_size)
            );
            return Self::pass_through(asset, PassReason::AlreadySmall, started);
        }

        match self.try_reencode(asset) {
            Ok((data, format, width, height, stages)) => {
                let output_size = data.len() as u64;
                debug!(
                    "图片压缩完成: {} {} -> {} ({}x{}, {:?}, {} 阶段)",
                    asset.name,
                    format_bytes(original_size),
                    format_bytes(output_size),
                    width,
                    height,
                    format,
                    stages
                );
                NormalizedAsset {
                    asset: Asset::new(asset.name.clone(), format.content_type(), data),
                    report: NormalizationReport::new(
                        original_size,
                        output_size,
                        NormalizeOutcome::Reencoded {
                            format,
                            width,
                            height,
                            stages,
                        },
                        started,
                    ),
                }
            }
            Err(e) => {
                warn!("图片压缩失败，使用原始文件: {}, 错误: {}", asset.name, e);
                Self::fallback(asset, &e, started)
            }
        }
    }

    /// 压缩线程异常时构造回退结果
    pub fn fallback_for(asset: &Asset, error: &NormalizationError) -> NormalizedAsset {
        Self::fallback(asset, error, Instant::now())
    }

    fn fallback(asset: &Asset, error: &NormalizationError, started: Instant) -> NormalizedAsset {
        NormalizedAsset {
            asset: asset.clone(),
            report: NormalizationReport::new(
                asset.size(),
                asset.size(),
                NormalizeOutcome::Fallback {
                    error: error.to_string(),
                },
                started,
            ),
        }
    }

    fn pass_through(asset: &Asset, reason: PassReason, started: Instant) -> NormalizedAsset {
        NormalizedAsset {
            asset: asset.clone(),
            report: NormalizationReport::new(
                asset.size(),
                asset.size(),
                NormalizeOutcome::PassThrough { reason },
                started,
            ),
        }
    }

    fn try_reencode(
        &self,
        asset: &Asset,
    ) -> Result<(Vec<u8>, TargetFormat, u32, u32, u8), NormalizationError> {
        let image = image::load_from_memory(&asset.data)
            .map_err(|e| NormalizationError::Decode(e.to_string()))?;

        let mut last = None;
        let mut stage_count = 0u8;

        for stage in self.constraints.stages() {
            stage_count += 1;
            let (width, height) = image.dimensions();
            let (target_w, target_h) =
                fit_dimensions(width, height, stage.max_width, stage.max_height);

            let resized = if (target_w, target_h) == (width, height) {
                image.clone()
            } else {
                image.resize_exact(target_w, target_h, FilterType::Triangle)
            };

            let (data, format) =
                encode_with_fallback(&resized, self.constraints.target_format, stage.quality)?;
            let fits = data.len() as u64 <= self.constraints.max_output_bytes;
            last = Some((data, format, target_w, target_h));

            if fits {
                break;
            }
        }

        let (data, format, width, height) =
            last.ok_or_else(|| NormalizationError::Encode("没有可用的压缩阶段".to_string()))?;
        Ok((data, format, width, height, stage_count))
    }
}

/// 等比缩放，使宽高都不超过上限（不放大）
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }

    let aspect = width as f64 / height as f64;
    let mut w = width as f64;
    let mut h = height as f64;

    if w > max_width as f64 {
        w = max_width as f64;
        h = w / aspect;
    }
    if h > max_height as f64 {
        h = max_height as f64;
        w = h * aspect;
    }

    ((w.round() as u32).max(1), (h.round() as u32).max(1))
}

fn jpeg_quality(quality: f32) -> u8 {
    (quality.clamp(0.0, 1.0) * 100.0).round().clamp(1.0, 100.0) as u8
}

fn encode(image: &DynamicImage, format: TargetFormat, quality: f32) -> Result<Vec<u8>, ImageError> {
    // JPEG 不支持 alpha 通道，WebP 编码器只接受 8 位 RGB(A)
    let prepared = match format {
        TargetFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        TargetFormat::Webp => DynamicImage::ImageRgba8(image.to_rgba8()),
        TargetFormat::Png => image.clone(),
    };

    let mut buffer = Cursor::new(Vec::new());
    prepared.write_to(&mut buffer, format.output_format(quality))?;
    Ok(buffer.into_inner())
}

fn encode_with_fallback(
    image: &DynamicImage,
    format: TargetFormat,
    quality: f32,
) -> Result<(Vec<u8>, TargetFormat), NormalizationError> {
    match encode(image, format, quality) {
        Ok(data) => Ok((data, format)),
        Err(ImageError::Unsupported(e)) if format != TargetFormat::Jpeg => {
            debug!("{:?} 编码器不可用，回退到 JPEG: {}", format, e);
            encode(image, TargetFormat::Jpeg, quality)
                .map(|data| (data, TargetFormat::Jpeg))
                .map_err(|e| NormalizationError::Encode(e.to_string()))
        }
        Err(e) => Err(NormalizationError::Encode(e.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// 生成带噪声的 PNG，保证体积不会太小
    pub(crate) fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17) ^ (x * y)) as u8;
            Rgb([v, v.wrapping_mul(3), v.wrapping_add(91)])
        });
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, ImageOutputFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn constraints(max_output_bytes: u64) -> NormalizeConstraints {
        NormalizeConstraints {
            max_width: 200,
            max_height: 200,
            quality: 0.8,
            target_format: TargetFormat::Jpeg,
            max_output_bytes,
            progressive: true,
        }
    }

    #[test]
    fn test_fit_dimensions() {
        assert_eq!(fit_dimensions(4000, 3000, 1920, 1920), (1920, 1440));
        assert_eq!(fit_dimensions(1000, 4000, 1920, 1920), (480, 1920));
        assert_eq!(fit_dimensions(800, 600, 1920, 1920), (800, 600));
        assert_eq!(fit_dimensions(5000, 10, 100, 100), (100, 1));
    }

    #[test]
    fn test_non_image_passes_through() {
        let normalizer = AssetNormalizer::new(constraints(10));
        let asset = Asset::new("report.pdf", "application/pdf", vec![7u8; 4096]);

        let out = normalizer.normalize(&asset);
        assert_eq!(out.asset, asset);
        assert_eq!(
            out.report.outcome,
            NormalizeOutcome::PassThrough {
                reason: PassReason::NotImage
            }
        );
    }

    #[test]
    fn test_small_image_is_byte_identical() {
        let normalizer = AssetNormalizer::new(NormalizeConstraints::default());
        let data = noisy_png(64, 64);
        let asset = Asset::new("small.png", "image/png", data.clone());
        assert!(asset.size() <= normalizer.constraints().skip_threshold());

        let out = normalizer.normalize(&asset);
        assert_eq!(out.asset.data.as_ref(), data.as_slice());
        assert_eq!(out.asset.content_type, "image/png");
        assert_eq!(out.report.ratio, 1.0);
        assert!(!out.report.is_fault());
    }

    #[test]
    fn test_skip_threshold_boundary() {
        let data = noisy_png(32, 32);
        // 恰好等于阈值：跳过
        let normalizer = AssetNormalizer::new(constraints(data.len() as u64 * 2));
        let asset = Asset::new("edge.png", "image/png", data.clone());
        let out = normalizer.normalize(&asset);
        assert_eq!(
            out.report.outcome,
            NormalizeOutcome::PassThrough {
                reason: PassReason::AlreadySmall
            }
        );
        assert_eq!(out.asset.data.as_ref(), data.as_slice());
    }

    #[test]
    fn test_large_image_is_resized_and_reencoded() {
        let normalizer = AssetNormalizer::new(constraints(1024));
        let asset = Asset::new("wide.png", "image/png", noisy_png(800, 400));

        let out = normalizer.normalize(&asset);
        match out.report.outcome {
            NormalizeOutcome::Reencoded {
                format,
                width,
                height,
                stages,
            } => {
                assert_eq!(format, TargetFormat::Jpeg);
                assert!(width <= 200 && height <= 200);
                assert!(stages >= 1 && stages <= 3);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // 保留原始文件名，MIME 更新为输出格式
        assert_eq!(out.asset.name, "wide.png");
        assert_eq!(out.asset.content_type, "image/jpeg");
        assert_eq!(out.report.output_size, out.asset.size());

        let decoded = image::load_from_memory(&out.asset.data).unwrap();
        let (w, h) = decoded.dimensions();
        assert_eq!(w, 200);
        assert_eq!(h, 100);
    }

    #[test]
    fn test_non_progressive_uses_single_stage() {
        let mut c = constraints(1);
        c.progressive = false;
        let normalizer = AssetNormalizer::new(c);
        let asset = Asset::new("a.png", "image/png", noisy_png(300, 300));

        let out = normalizer.normalize(&asset);
        assert!(matches!(
            out.report.outcome,
            NormalizeOutcome::Reencoded { stages: 1, .. }
        ));
    }

    #[test]
    fn test_progressive_runs_all_stages_when_target_unreachable() {
        let normalizer = AssetNormalizer::new(constraints(1));
        let asset = Asset::new("a.png", "image/png", noisy_png(300, 300));

        let out = normalizer.normalize(&asset);
        assert!(matches!(
            out.report.outcome,
            NormalizeOutcome::Reencoded { stages: 3, .. }
        ));
    }

    #[test]
    fn test_corrupt_image_falls_back_to_original() {
        let normalizer = AssetNormalizer::new(constraints(16));
        let data = b"this is definitely not a jpeg".repeat(8);
        let asset = Asset::new("broken.jpg", "image/jpeg", data.clone());

        let out = normalizer.normalize(&asset);
        assert!(out.report.is_fault());
        assert_eq!(out.asset.data.as_ref(), data.as_slice());
        assert_eq!(out.asset.content_type, "image/jpeg");
        assert_eq!(out.report.ratio, 1.0);
    }

    #[test]
    fn test_webp_target_falls_back_when_unsupported() {
        let mut c = constraints(1024);
        c.target_format = TargetFormat::Webp;
        let normalizer = AssetNormalizer::new(c);
        let asset = Asset::new("a.png", "image/png", noisy_png(400, 400));

        let out = normalizer.normalize(&asset);
        assert!(!out.report.is_fault());
        assert!(
            out.asset.content_type == "image/webp" || out.asset.content_type == "image/jpeg"
        );
        assert!(image::load_from_memory(&out.asset.data).is_ok());
    }
}
