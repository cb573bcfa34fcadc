//! Evidence rendering: detection outlines and labels on a copy of the frame,
//! JPEG encoding.

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

use super::catalog::ClassCatalog;
use super::result::{BBox, Detection};
use crate::frame::{Frame, CHANNELS};

const VIOLATION_THICKNESS: u32 = 3;
const DEFAULT_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 18.0;
const LABEL_PADDING: u32 = 3;
const LABEL_TEXT: Rgb<u8> = Rgb([255, 255, 255]);

/// TrueType/OpenType font for the `! no_hardhat: 0.87` labels.
#[derive(Clone)]
pub struct LabelFont {
    font: FontArc,
}

impl LabelFont {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read label font {}", path.display()))?;
        Self::from_bytes(bytes).with_context(|| format!("parse label font {}", path.display()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let font = FontArc::try_from_vec(bytes).map_err(|e| anyhow!("invalid font: {e}"))?;
        Ok(Self { font })
    }
}

impl std::fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LabelFont")
    }
}

/// Draw detection outlines, and labels when a font is given, on a new frame.
/// The input frame is left untouched.
pub fn annotate(
    frame: &Frame,
    detections: &[Detection],
    catalog: &ClassCatalog,
    font: Option<&LabelFont>,
) -> Result<Frame> {
    let mut image = to_rgb_image(frame)?;
    for det in detections {
        let color = rgb(catalog.color(&det.class_name));
        let thickness = if det.is_violation {
            VIOLATION_THICKNESS
        } else {
            DEFAULT_THICKNESS
        };
        for inset in 0..thickness {
            if let Some(rect) = inset_rect(&det.bbox, inset) {
                draw_hollow_rect_mut(&mut image, rect, color);
            }
        }
        if let Some(font) = font {
            draw_label(&mut image, det, color, font);
        }
    }

    let mut data = Vec::with_capacity(frame.byte_len());
    for px in image.pixels() {
        data.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    Frame::with_timestamp(
        data,
        frame.width,
        frame.height,
        frame.sequence,
        frame.captured_at,
    )
}

fn rgb(bgr: [u8; 3]) -> Rgb<u8> {
    Rgb([bgr[2], bgr[1], bgr[0]])
}

fn inset_rect(bbox: &BBox, inset: u32) -> Option<Rect> {
    let inset = inset as i32;
    let width = bbox.width() - 2 * inset;
    let height = bbox.height() - 2 * inset;
    if width <= 0 || height <= 0 {
        return None;
    }
    Some(Rect::at(bbox.x1 + inset, bbox.y1 + inset).of_size(width as u32, height as u32))
}

fn label_text(det: &Detection) -> String {
    let label = format!("{}: {:.2}", det.class_name, det.confidence);
    if det.is_violation {
        format!("! {label}")
    } else {
        label
    }
}

/// Fill the label band above the box, or inside its top edge when the box
/// touches the top of the frame. Returns the text origin.
fn draw_label_band(image: &mut RgbImage, bbox: &BBox, text: (u32, u32), color: Rgb<u8>) -> (i32, i32) {
    let band_w = text.0 + 2 * LABEL_PADDING;
    let band_h = text.1 + 2 * LABEL_PADDING;
    let top = if bbox.y1 >= band_h as i32 {
        bbox.y1 - band_h as i32
    } else {
        bbox.y1
    };
    draw_filled_rect_mut(image, Rect::at(bbox.x1, top).of_size(band_w, band_h), color);
    (bbox.x1 + LABEL_PADDING as i32, top + LABEL_PADDING as i32)
}

fn draw_label(image: &mut RgbImage, det: &Detection, color: Rgb<u8>, font: &LabelFont) {
    let text = label_text(det);
    let scale = PxScale::from(LABEL_SCALE);
    let size = text_size(scale, &font.font, &text);
    let (x, y) = draw_label_band(image, &det.bbox, size, color);
    draw_text_mut(image, LABEL_TEXT, x, y, scale, &font.font, &text);
}

fn to_rgb_image(frame: &Frame) -> Result<RgbImage> {
    let mut rgb = Vec::with_capacity(frame.byte_len());
    for px in frame.pixels().chunks_exact(CHANNELS) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))
}

/// Encode a frame as JPEG. `quality` is clamped to 1..=100.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let image = to_rgb_image(frame)?;
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_on_a_copy() {
        let catalog = ClassCatalog::ppe();
        let frame = Frame::filled(40, 30, [10, 10, 10], 5).unwrap();
        let det = catalog.detection(2, 0.9, BBox::new(5, 5, 20, 20));
        let annotated = annotate(&frame, &[det], &catalog, None).unwrap();

        assert_eq!(frame.pixel(5, 5), Some([10, 10, 10]));
        assert_eq!(annotated.pixel(5, 5), Some([0, 0, 255]));
        // Violations use a three pixel outline.
        assert_eq!(annotated.pixel(7, 10), Some([0, 0, 255]));
        assert_eq!(annotated.pixel(8, 10), Some([10, 10, 10]));
        assert_eq!(annotated.sequence, 5);
    }

    #[test]
    fn compliant_outline_is_thinner() {
        let catalog = ClassCatalog::ppe();
        let frame = Frame::filled(40, 30, [10, 10, 10], 1).unwrap();
        let det = catalog.detection(1, 0.9, BBox::new(5, 5, 20, 20));
        let annotated = annotate(&frame, &[det], &catalog, None).unwrap();
        assert_eq!(annotated.pixel(6, 10), Some([0, 200, 0]));
        assert_eq!(annotated.pixel(7, 10), Some([10, 10, 10]));
    }

    #[test]
    fn boxes_touching_the_edge_are_clamped() {
        let catalog = ClassCatalog::ppe();
        let frame = Frame::filled(16, 16, [0, 0, 0], 1).unwrap();
        let det = catalog.detection(0, 0.9, BBox::new(0, 0, 16, 16));
        let annotated = annotate(&frame, &[det], &catalog, None).unwrap();
        assert_eq!(annotated.pixel(15, 15), Some([255, 255, 255]));
    }

    #[test]
    fn violation_labels_are_flagged() {
        let catalog = ClassCatalog::ppe();
        let violation = catalog.detection(2, 0.874, BBox::new(0, 0, 10, 10));
        let compliant = catalog.detection(1, 0.9, BBox::new(0, 0, 10, 10));
        assert_eq!(label_text(&violation), "! no_hardhat: 0.87");
        assert_eq!(label_text(&compliant), "hardhat: 0.90");
    }

    #[test]
    fn label_band_sits_above_the_box() {
        let mut image = RgbImage::new(60, 60);
        let red = Rgb([255, 0, 0]);
        let origin = draw_label_band(&mut image, &BBox::new(5, 30, 40, 55), (20, 8), red);
        // 14px band ending at the top edge of the box.
        assert_eq!(origin, (8, 19));
        assert_eq!(*image.get_pixel(5, 16), red);
        assert_eq!(*image.get_pixel(30, 29), red);
        assert_eq!(*image.get_pixel(5, 15), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(5, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn label_band_moves_inside_a_box_at_the_top() {
        let mut image = RgbImage::new(60, 60);
        let red = Rgb([255, 0, 0]);
        let origin = draw_label_band(&mut image, &BBox::new(5, 2, 40, 40), (20, 8), red);
        assert_eq!(origin, (8, 5));
        assert_eq!(*image.get_pixel(5, 2), red);
        assert_eq!(*image.get_pixel(5, 15), red);
        assert_eq!(*image.get_pixel(5, 16), Rgb([0, 0, 0]));
    }

    #[test]
    fn unreadable_font_is_an_error() {
        assert!(LabelFont::from_bytes(b"not a font".to_vec()).is_err());
        assert!(LabelFont::load(Path::new("/nonexistent/label.ttf")).is_err());
    }

    #[test]
    fn encodes_jpeg() {
        let frame = Frame::filled(32, 24, [0, 0, 255], 1).unwrap();
        let jpeg = encode_jpeg(&frame, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
