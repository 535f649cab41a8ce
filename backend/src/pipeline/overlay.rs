use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use serde::Deserialize;
use shared::Label;
use std::path::PathBuf;

use super::colormap::{jet, jet_unit};
use super::font::FontSet;
use super::saliency::SaliencyMap;

const HEADER_BACKGROUND: Rgb<u8> = Rgb([30, 41, 59]);
const PNEUMONIA_COLOR: Rgb<u8> = Rgb([239, 68, 68]);
const NORMAL_COLOR: Rgb<u8> = Rgb([16, 185, 129]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const ROI_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverlayConfig {
    pub attention_threshold: f32,
    pub min_region_fraction: f32,
    pub max_regions: usize,
    pub base_weight: f32,
    pub pneumonia_alpha: f32,
    pub normal_alpha: f32,
    pub header_height: u32,
    pub legend_width: u32,
    pub legend_height: u32,
    pub box_thickness: u32,
    pub bold_font: PathBuf,
    pub regular_font: PathBuf,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            attention_threshold: 0.6,
            min_region_fraction: 0.01,
            max_regions: 3,
            base_weight: 0.7,
            pneumonia_alpha: 0.5,
            normal_alpha: 0.3,
            header_height: 80,
            legend_width: 200,
            legend_height: 30,
            box_thickness: 3,
            bold_font: PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf"),
            regular_font: PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
        }
    }
}

impl OverlayConfig {
    pub fn alpha_for(&self, label: Label) -> f32 {
        match label {
            Label::Pneumonia => self.pneumonia_alpha,
            Label::Normal => self.normal_alpha,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    fn bounding(points: &[Point<i32>]) -> Option<Self> {
        let min_x = points.iter().map(|p| p.x).min()?;
        let max_x = points.iter().map(|p| p.x).max()?;
        let min_y = points.iter().map(|p| p.y).min()?;
        let max_y = points.iter().map(|p| p.y).max()?;
        Some(Self {
            x: min_x.max(0) as u32,
            y: min_y.max(0) as u32,
            width: (max_x - min_x + 1) as u32,
            height: (max_y - min_y + 1) as u32,
        })
    }
}

pub struct OverlayImage {
    pub image: RgbImage,
    /// ROI boxes drawn on the image, in label order.
    pub regions: Vec<Region>,
}

/// Shoelace area of a closed contour polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    twice.abs() as f64 / 2.0
}

fn upsample(map: &SaliencyMap, width: u32, height: u32) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let (rows, cols) = map.dim();
    let source = ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
        Luma([map.values()[[y as usize, x as usize]]])
    });
    let mut resized = imageops::resize(&source, width, height, FilterType::Triangle);
    for p in resized.pixels_mut() {
        p.0[0] = p.0[0].clamp(0.0, 1.0);
    }
    resized
}

fn blend(original: &RgbImage, heat: &ImageBuffer<Luma<f32>, Vec<f32>>, base: f32, alpha: f32) -> RgbImage {
    RgbImage::from_fn(original.width(), original.height(), |x, y| {
        let source = original.get_pixel(x, y);
        let color = jet_unit(heat.get_pixel(x, y)[0]);
        Rgb(std::array::from_fn(|c| {
            (base * source[c] as f32 + alpha * color[c] as f32)
                .round()
                .clamp(0.0, 255.0) as u8
        }))
    })
}

/// Bounding boxes of the outermost high-attention contours covering at least
/// `min_region_fraction` of the image, largest first.
pub fn attention_regions(heat: &ImageBuffer<Luma<f32>, Vec<f32>>, config: &OverlayConfig) -> Vec<Region> {
    let mask = GrayImage::from_fn(heat.width(), heat.height(), |x, y| {
        if heat.get_pixel(x, y)[0] > config.attention_threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let min_area = (heat.width() as f64 * heat.height() as f64) * config.min_region_fraction as f64;

    let mut external: Vec<(f64, Region)> = find_contours::<i32>(&mask)
        .into_iter()
        .filter(|c: &Contour<i32>| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter_map(|c| {
            let area = polygon_area(&c.points);
            if area < min_area {
                return None;
            }
            Region::bounding(&c.points).map(|r| (area, r))
        })
        .collect();
    external.sort_by(|a, b| b.0.total_cmp(&a.0));
    external.into_iter().map(|(_, r)| r).collect()
}

pub struct OverlayRenderer {
    config: OverlayConfig,
    fonts: FontSet,
}

impl OverlayRenderer {
    pub fn new(config: OverlayConfig, fonts: FontSet) -> Self {
        Self { config, fonts }
    }

    pub fn render(
        &self,
        original: &RgbImage,
        map: &SaliencyMap,
        label: Label,
        confidence_pct: f32,
        intensity: f32,
    ) -> OverlayImage {
        let (width, height) = original.dimensions();
        let heat = upsample(map, width, height);
        let mut body = blend(original, &heat, self.config.base_weight, self.config.alpha_for(label));

        let regions = match label {
            Label::Pneumonia => {
                let mut regions = attention_regions(&heat, &self.config);
                regions.truncate(self.config.max_regions);
                regions
            }
            Label::Normal => Vec::new(),
        };
        for (i, region) in regions.iter().enumerate() {
            self.draw_region(&mut body, region, &format!("ROI {}", i + 1));
        }

        let header = self.header(width, label, confidence_pct, intensity);
        let mut image = RgbImage::new(width, height + self.config.header_height);
        imageops::replace(&mut image, &header, 0, 0);
        imageops::replace(&mut image, &body, 0, self.config.header_height as i64);

        OverlayImage { image, regions }
    }

    fn draw_region(&self, canvas: &mut RgbImage, region: &Region, text: &str) {
        for inset in 0..self.config.box_thickness {
            let w = region.width.saturating_sub(2 * inset);
            let h = region.height.saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((region.x + inset) as i32, (region.y + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(canvas, rect, ROI_COLOR);
        }
        let size = 16.0;
        let (_, text_height) = self.fonts.bold.measure(size, text);
        let y = (region.y as i32 - text_height as i32 - 6).max(0);
        self.fonts.bold.draw(canvas, ROI_COLOR, region.x as i32, y, size, text);
    }

    fn header(&self, width: u32, label: Label, confidence_pct: f32, intensity: f32) -> RgbImage {
        let mut header = RgbImage::from_pixel(width, self.config.header_height, HEADER_BACKGROUND);
        let diagnosis_color = match label {
            Label::Pneumonia => PNEUMONIA_COLOR,
            Label::Normal => NORMAL_COLOR,
        };
        self.fonts
            .bold
            .draw(&mut header, diagnosis_color, 20, 15, 24.0, &format!("Diagnosis: {}", label));
        self.fonts.regular.draw(
            &mut header,
            TEXT_COLOR,
            20,
            50,
            16.0,
            &format!(
                "Confidence: {:.1}% | Intensity: {:.1}%",
                confidence_pct,
                intensity * 100.0
            ),
        );

        let legend_width = self.config.legend_width;
        let legend_height = self.config.legend_height;
        let legend_x = width as i32 - legend_width as i32 - 20;
        let legend_y = 25;
        for i in 0..legend_width {
            let level = (255 * i / legend_width) as u8;
            let rect = Rect::at(legend_x + i as i32, legend_y).of_size(2, legend_height + 1);
            draw_filled_rect_mut(&mut header, rect, jet(level));
        }
        self.fonts
            .regular
            .draw(&mut header, TEXT_COLOR, legend_x, legend_y - 20, 16.0, "Attention Intensity");
        let labels_y = legend_y + legend_height as i32 + 5;
        self.fonts
            .regular
            .draw(&mut header, TEXT_COLOR, legend_x, labels_y, 16.0, "Low");
        self.fonts.regular.draw(
            &mut header,
            TEXT_COLOR,
            legend_x + legend_width as i32 - 30,
            labels_y,
            16.0,
            "High",
        );
        header
    }
}
