//! Text-to-image generation.
//!
//! Parameters are clamped to the ranges the local pipeline supports and a
//! default negative prompt is applied when the caller gives none. The actual
//! sampling sits behind [`ImageBackend`]; the default backend renders a
//! deterministic prompt-seeded gradient so the whole path (queueing,
//! progress, cancellation, encoding) works without model weights.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use image::{ImageOutputFormat, Rgba, RgbaImage};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::ToolError;
use crate::executor::{JobContext, JobKind, JobSpec};
use crate::plugins::{float_or, int_or, opt_str, require_str};
use crate::registry::{
    FunctionSpec, Invocation, InvokeContext, ParamSpec, ParamType, Plugin, PluginDescriptor,
};

const DEFAULT_NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted, deformed, ugly, bad anatomy";

const MIN_DIMENSION: i64 = 512;
const MAX_DIMENSION: i64 = 1024;
const MIN_STEPS: i64 = 10;
const MAX_STEPS: i64 = 50;
const MIN_GUIDANCE: f64 = 1.0;
const MAX_GUIDANCE: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f64,
}

/// Seam for the sampling pipeline. Implementations report progress and honor
/// cancellation through the job context.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, request: &ImageRequest, ctx: &JobContext)
        -> Result<RgbaImage, ToolError>;
}

/// Deterministic local backend: one simulated denoising pass per step, then
/// a prompt-seeded gradient rendered off the async threads.
pub struct ProceduralBackend;

#[async_trait]
impl ImageBackend for ProceduralBackend {
    async fn generate(
        &self,
        request: &ImageRequest,
        ctx: &JobContext,
    ) -> Result<RgbaImage, ToolError> {
        for step in 0..request.steps {
            ctx.checkpoint()?;
            ctx.report_progress((step * 95 / request.steps) as u8);
            tokio::task::yield_now().await;
        }

        let seed = Sha256::digest(request.prompt.as_bytes());
        let (width, height) = (request.width, request.height);
        let cancel = ctx.cancel_token();
        let image = tokio::task::spawn_blocking(move || {
            let base = [seed[0], seed[1], seed[2]];
            let mut img = RgbaImage::new(width, height);
            for (x, y, pixel) in img.enumerate_pixels_mut() {
                let fx = (x * 255 / width.max(1)) as u8;
                let fy = (y * 255 / height.max(1)) as u8;
                *pixel = Rgba([
                    base[0].wrapping_add(fx),
                    base[1].wrapping_add(fy),
                    base[2].wrapping_add(fx ^ fy),
                    255,
                ]);
            }
            img
        })
        .await
        .map_err(|e| ToolError::Internal(format!("render task failed: {e}")))?;

        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        ctx.report_progress(95);
        Ok(image)
    }
}

pub struct ImageGenerationPlugin {
    backend: Arc<dyn ImageBackend>,
}

impl Default for ImageGenerationPlugin {
    fn default() -> Self {
        Self {
            backend: Arc::new(ProceduralBackend),
        }
    }
}

impl ImageGenerationPlugin {
    pub fn with_backend(backend: Arc<dyn ImageBackend>) -> Self {
        Self { backend }
    }
}

fn parse_request(args: &Map<String, Value>) -> Result<ImageRequest, ToolError> {
    let prompt = require_str(args, "prompt")?.trim().to_string();
    if prompt.is_empty() {
        return Err(ToolError::invalid_argument("prompt", "must not be empty"));
    }
    let negative_prompt = opt_str(args, "negative_prompt")
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_NEGATIVE_PROMPT)
        .to_string();
    let width = int_or(args, "width", 1024)?.clamp(MIN_DIMENSION, MAX_DIMENSION) as u32;
    let height = int_or(args, "height", 1024)?.clamp(MIN_DIMENSION, MAX_DIMENSION) as u32;
    let steps = int_or(args, "num_inference_steps", 20)?.clamp(MIN_STEPS, MAX_STEPS) as u32;
    let guidance_scale = float_or(args, "guidance_scale", 7.5)?.clamp(MIN_GUIDANCE, MAX_GUIDANCE);
    Ok(ImageRequest {
        prompt,
        negative_prompt,
        width,
        height,
        steps,
        guidance_scale,
    })
}

#[async_trait]
impl Plugin for ImageGenerationPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "image_generation",
            description: "Generates images from text prompts on the local GPU",
            functions: vec![
                FunctionSpec {
                    name: "generate_image",
                    description: "Generate an image from a text prompt. Runs in the background; \
                                  progress and the finished image arrive as events.",
                    params: vec![
                        ParamSpec::required(
                            "prompt",
                            ParamType::String,
                            "What the image should show",
                        ),
                        ParamSpec::optional(
                            "negative_prompt",
                            ParamType::String,
                            "What the image should avoid",
                        ),
                        ParamSpec::optional("width", ParamType::Integer, "Image width in pixels")
                            .with_default(json!(1024)),
                        ParamSpec::optional("height", ParamType::Integer, "Image height in pixels")
                            .with_default(json!(1024)),
                        ParamSpec::optional(
                            "num_inference_steps",
                            ParamType::Integer,
                            "Denoising steps; more is slower but sharper",
                        )
                        .with_default(json!(20)),
                        ParamSpec::optional(
                            "guidance_scale",
                            ParamType::Number,
                            "How strongly the prompt steers sampling",
                        )
                        .with_default(json!(7.5)),
                    ],
                },
                FunctionSpec {
                    name: "list_generated_images",
                    description: "List metadata of the images generated this session",
                    params: vec![],
                },
            ],
        }
    }

    async fn invoke(
        &self,
        ctx: &InvokeContext,
        function: &str,
        args: Map<String, Value>,
    ) -> Result<Invocation, ToolError> {
        if function == "list_generated_images" {
            let session = ctx.sessions.get(ctx.session_id)?;
            let images = session.generated_images().await;
            return Ok(Invocation::Immediate(json!({
                "count": images.len(),
                "images": images,
            })));
        }

        let request = parse_request(&args)?;
        debug!(width = request.width, height = request.height, steps = request.steps, "image job queued");
        let backend = self.backend.clone();

        Ok(Invocation::Deferred(JobSpec {
            kind: JobKind::ImageGeneration,
            event_prefix: "image_generation",
            document_id: None,
            store_artifact: true,
            run: Box::new(move |ctx| {
                Box::pin(async move {
                    let image = backend.generate(&request, &ctx).await?;
                    ctx.checkpoint()?;

                    let mut png = Vec::new();
                    image
                        .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
                        .map_err(|e| ToolError::Internal(format!("png encode failed: {e}")))?;

                    let image_id = Uuid::new_v4();
                    ctx.report_progress(100);
                    Ok(json!({
                        "image_id": image_id,
                        "filename": format!("generated_{}.png", image_id.simple()),
                        "prompt": request.prompt,
                        "negative_prompt": request.negative_prompt,
                        "width": request.width,
                        "height": request.height,
                        "num_inference_steps": request.steps,
                        "guidance_scale": request.guidance_scale,
                        "image_base64": BASE64.encode(&png),
                        "generated_at": Utc::now().to_rfc3339(),
                    }))
                })
            }),
        }))
    }
}
