//! PDF rasterisation: render pages to JPEG bytes via pdfium.
//!
//! ## Why a blocking trait?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async
//! contexts; its document handles are not `Send` either. The renderer is
//! therefore a *blocking* capability: the orchestrator drives it from a
//! single `spawn_blocking` producer thread that opens the document once,
//! renders pages in order, and pushes each result into the bounded queue.
//! The trait seam also lets tests substitute a renderer that fabricates
//! page bytes without pdfium installed.
//!
//! ## Why cap pixels, not just DPI?
//!
//! Page sizes vary wildly: an A0 poster at 300 DPI would produce an image
//! far beyond both memory comfort and the vision model's useful input size.
//! `max_dimension` caps the longest edge regardless of physical page size,
//! scaling the other edge proportionally.

use crate::error::RenderError;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, warn};

/// Knobs for one rendering run.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub dpi: u32,
    pub jpeg_quality: u8,
    /// Cap on the longest rendered edge, in pixels.
    pub max_dimension: u32,
}

/// One item produced by the renderer.
#[derive(Debug)]
pub enum Rendered {
    /// The page rasterised cleanly.
    Page { index: usize, jpeg: Vec<u8> },
    /// The page could not be rasterised; the rest of the document continues.
    Failed { index: usize, error: RenderError },
}

/// Rasterisation capability consumed by the orchestrator.
///
/// All methods block; callers run them on a blocking thread.
pub trait PageRenderer: Send + Sync + 'static {
    /// Number of pages in the document.
    fn page_count(&self, pdf: &Path) -> Result<usize, RenderError>;

    /// Render `indices` in the given order, handing each result to `sink`.
    ///
    /// `sink` returns `false` when the consumer has gone away; rendering
    /// stops early in that case. Per-page failures are reported through the
    /// sink as [`Rendered::Failed`]; only a document-level failure (cannot
    /// open the PDF at all) is returned as `Err`.
    fn render_pages(
        &self,
        pdf: &Path,
        indices: &[usize],
        opts: &RenderOptions,
        sink: &mut dyn FnMut(Rendered) -> bool,
    ) -> Result<(), RenderError>;
}

/// Production renderer backed by pdfium.
#[derive(Default)]
pub struct PdfiumRenderer;

impl PdfiumRenderer {
    pub fn new() -> Self {
        Self
    }

    fn open<'a>(&self, pdfium: &'a Pdfium, pdf: &Path) -> Result<PdfDocument<'a>, RenderError> {
        pdfium
            .load_pdf_from_file(pdf, None)
            .map_err(|e| RenderError::Open {
                path: pdf.to_path_buf(),
                detail: format!("{e:?}"),
            })
    }
}

impl PageRenderer for PdfiumRenderer {
    fn page_count(&self, pdf: &Path) -> Result<usize, RenderError> {
        let pdfium = Pdfium::default();
        let document = self.open(&pdfium, pdf)?;
        Ok(document.pages().len() as usize)
    }

    fn render_pages(
        &self,
        pdf: &Path,
        indices: &[usize],
        opts: &RenderOptions,
        sink: &mut dyn FnMut(Rendered) -> bool,
    ) -> Result<(), RenderError> {
        let pdfium = Pdfium::default();
        let document = self.open(&pdfium, pdf)?;
        let pages = document.pages();
        let total = pages.len() as usize;

        for &index in indices {
            if index >= total {
                warn!("Skipping page {index} (out of range, total={total})");
                continue;
            }

            let item = match render_one(&pages, index, opts) {
                Ok(jpeg) => {
                    debug!("Rendered page {index} → {} JPEG bytes", jpeg.len());
                    Rendered::Page { index, jpeg }
                }
                Err(error) => {
                    warn!("{error}");
                    Rendered::Failed { index, error }
                }
            };

            if !sink(item) {
                debug!("Render consumer gone; stopping at page {index}");
                break;
            }
        }
        Ok(())
    }
}

fn render_one(
    pages: &PdfPages<'_>,
    index: usize,
    opts: &RenderOptions,
) -> Result<Vec<u8>, RenderError> {
    let page_err = |detail: String| RenderError::Page { index, detail };

    let page = pages
        .get(index as u16)
        .map_err(|e| page_err(format!("{e:?}")))?;

    let width = scaled_width(
        page.width().value,
        page.height().value,
        opts.dpi,
        opts.max_dimension,
    );
    let config = PdfRenderConfig::new()
        .set_target_width(width)
        .set_maximum_height(opts.max_dimension as i32);

    let bitmap = page
        .render_with_config(&config)
        .map_err(|e| page_err(format!("{e:?}")))?;

    encode_jpeg(&bitmap.as_image(), opts.jpeg_quality).map_err(page_err)
}

/// Target render width in pixels for a page of `w_pts` × `h_pts` points,
/// honouring the requested DPI but capping the longest edge at `max_dim`.
fn scaled_width(w_pts: f32, h_pts: f32, dpi: u32, max_dim: u32) -> i32 {
    let mut scale = dpi as f32 / 72.0;
    let long_edge = w_pts.max(h_pts) * scale;
    if long_edge > max_dim as f32 {
        scale *= max_dim as f32 / long_edge;
    }
    (w_pts * scale).round().max(1.0) as i32
}

/// Encode a rendered page as JPEG at the given quality.
///
/// JPEG (not PNG) because the recognised pages travel base64-encoded inside
/// JSON request bodies; at 85 quality the text stays crisp while a 300-DPI
/// book page compresses to a few hundred kilobytes instead of several
/// megabytes.
fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, String> {
    // pdfium bitmaps come back RGBA; JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buf), quality);
    rgb.write_with_encoder(encoder).map_err(|e| e.to_string())?;
    Ok(buf)
}
