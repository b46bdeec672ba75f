//! Drawing detections onto frames.
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use image::{codecs::jpeg::JpegEncoder, ColorType, ImageResult, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::{point, Font, Scale};

use crate::detector::DetectionBox;

const LABEL_SCALE: Scale = Scale { x: 16.0, y: 16.0 };
const LABEL_PADDING: i32 = 2;

const BOX_COLORS: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
];

/// Places where we look for a label font when none is configured.
const SYSTEM_FONTS: [&str; 3] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
];

lazy_static! {
    static ref SYSTEM_FONT: Option<Font<'static>> = SYSTEM_FONTS
        .iter()
        .find_map(|path| read_font(Path::new(path)));
}

/// Draws bounding boxes with class and confidence labels.
pub struct BoxPainter {
    font: Option<Font<'static>>,
}

impl BoxPainter {
    /// Use the font at `font_path`, falling back to a system font.
    ///
    /// Without any font the boxes are still drawn, only the label text is missing.
    pub fn new(font_path: Option<PathBuf>) -> Self {
        let font = font_path
            .as_deref()
            .and_then(read_font)
            .or_else(|| SYSTEM_FONT.clone());

        if font.is_none() {
            log::warn!("No label font found, detections are drawn without text");
        }

        Self { font }
    }

    /// Painter that never draws text.
    pub fn without_labels() -> Self {
        Self { font: None }
    }

    /// Draw all boxes onto `frame`. The output keeps the dimensions of the input.
    pub fn paint(&self, mut frame: RgbImage, boxes: &[DetectionBox]) -> RgbImage {
        let (width, height) = frame.dimensions();

        for detection in boxes {
            let color = Rgb(BOX_COLORS[detection.class_id % BOX_COLORS.len()]);
            let [x_tl, y_tl, x_br, y_br] = detection.bbox;

            // Coordinate frame basis is on the top left corner
            let x = (x_tl as i32).clamp(0, width as i32 - 1);
            let y = (y_tl as i32).clamp(0, height as i32 - 1);
            let rect_width = ((x_br - x_tl) as u32).max(1);
            let rect_height = ((y_br - y_tl) as u32).max(1);

            let rect = Rect::at(x, y).of_size(rect_width, rect_height);
            draw_hollow_rect_mut(&mut frame, rect, color);
            if rect_width > 2 && rect_height > 2 {
                let inner = Rect::at(x + 1, y + 1).of_size(rect_width - 2, rect_height - 2);
                draw_hollow_rect_mut(&mut frame, inner, color);
            }

            if let Some(font) = &self.font {
                let text = format!("{} {:.2}", detection.class_name, detection.confidence);
                draw_label(&mut frame, font, &text, x, y, color);
            }
        }

        frame
    }
}

/// Draw `text` on a filled bar sitting on top of the box corner at `(x, y)`.
fn draw_label(frame: &mut RgbImage, font: &Font<'static>, text: &str, x: i32, y: i32, color: Rgb<u8>) {
    let text_width = text_width(font, text);
    let bar_height = LABEL_SCALE.y as i32 + 2 * LABEL_PADDING;
    // Put the bar inside the box when there is no room above it
    let bar_y = if y >= bar_height { y - bar_height } else { y };

    let bar = Rect::at(x, bar_y).of_size(
        (text_width + 2 * LABEL_PADDING) as u32,
        bar_height as u32,
    );
    draw_filled_rect_mut(frame, bar, color);
    draw_text_mut(
        frame,
        Rgb([255, 255, 255]),
        x + LABEL_PADDING,
        bar_y + LABEL_PADDING,
        LABEL_SCALE,
        font,
        text,
    );
}

fn text_width(font: &Font<'static>, text: &str) -> i32 {
    font.layout(text, LABEL_SCALE, point(0.0, 0.0))
        .filter_map(|glyph| glyph.pixel_bounding_box())
        .map(|bbox| bbox.max.x)
        .max()
        .unwrap_or(0)
        .max(1)
}

fn read_font(path: &Path) -> Option<Font<'static>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            log::debug!("Font {} not readable: {}", path.display(), e);
            return None;
        }
    };
    let font = Font::try_from_vec(data);
    if font.is_none() {
        log::warn!("{} is not a usable font", path.display());
    }
    font
}

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        frame,
        frame.width(),
        frame.height(),
        ColorType::Rgb8,
    )?;

    Ok(buf.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;

    fn detection(bbox: [f32; 4]) -> DetectionBox {
        DetectionBox {
            class_id: 0,
            class_name: "plastic".into(),
            confidence: 0.8,
            bbox,
        }
    }

    #[test]
    fn test_paint_keeps_dimensions_and_marks_box() {
        let frame = RgbImage::new(64, 48);
        let painter = BoxPainter::without_labels();

        let painted = painter.paint(frame, &[detection([10.0, 10.0, 30.0, 20.0])]);

        assert_eq!(painted.dimensions(), (64, 48));
        assert_eq!(painted.get_pixel(10, 10), &Rgb(BOX_COLORS[0]));
        assert_eq!(painted.get_pixel(20, 15), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_paint_tolerates_degenerate_boxes() {
        let frame = RgbImage::new(16, 16);
        let painter = BoxPainter::without_labels();

        let painted = painter.paint(
            frame,
            &[detection([15.0, 15.0, 15.0, 15.0]), detection([0.0, 0.0, 40.0, 40.0])],
        );

        assert_eq!(painted.dimensions(), (16, 16));
    }

    #[test]
    fn test_encode_jpeg_has_magic_bytes() -> ImageResult<()> {
        let jpeg = encode_jpeg(&RgbImage::new(8, 8), 80)?;
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        Ok(())
    }
}
