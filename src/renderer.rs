use eframe::egui::{pos2, vec2, Color32, ColorImage, Mesh, Pos2, Rect, Shape, Stroke, TextureId};

use crate::annotation::ToolType;
use crate::geometry::{Point, ViewTransform};
use crate::labelmap::Mask;

const LABELMAP_OPACITY: f32 = 0.45;
const ELLIPSE_SEGMENTS: usize = 48;
const PROBE_RADIUS: f32 = 4.0;
const ARROW_HEAD: f32 = 10.0;

const LABELMAP_PALETTE: [Color32; 6] = [
    Color32::from_rgb(230, 60, 60),
    Color32::from_rgb(60, 200, 90),
    Color32::from_rgb(70, 130, 240),
    Color32::from_rgb(240, 200, 40),
    Color32::from_rgb(200, 80, 220),
    Color32::from_rgb(40, 210, 210),
];

pub fn render_window_level(
    width_px: usize,
    height_px: usize,
    frame_pixels: &[i32],
    invert: bool,
    center: f32,
    width: f32,
) -> ColorImage {
    let effective_width = width.max(1.0);
    let low = center - effective_width / 2.0;
    let range = effective_width.max(1e-6);

    let pixels = frame_pixels
        .iter()
        .map(|&sample| {
            let normalized = ((sample as f32 - low) / range).clamp(0.0, 1.0);
            let gray = (normalized * 255.0).round() as u8;
            Color32::from_gray(if invert { 255 - gray } else { gray })
        })
        .collect();

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}

pub fn render_rgb(
    width_px: usize,
    height_px: usize,
    frame_pixels: &[u8],
    samples_per_pixel: u16,
) -> ColorImage {
    let spp = samples_per_pixel.max(1) as usize;
    let pixel_count = width_px.saturating_mul(height_px);
    let mut pixels: Vec<Color32> = frame_pixels
        .chunks_exact(spp)
        .take(pixel_count)
        .map(|chunk| match chunk {
            [r, g, b, ..] => Color32::from_rgb(*r, *g, *b),
            [gray, ..] => Color32::from_gray(*gray),
            [] => Color32::BLACK,
        })
        .collect();
    pixels.resize(pixel_count, Color32::BLACK);

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}

/// Deterministic overlay color for a segmentation layer.
pub fn labelmap_color(layer_id: u64) -> Color32 {
    LABELMAP_PALETTE[(layer_id as usize) % LABELMAP_PALETTE.len()]
}

/// Alpha-blends the set cells of `mask` over the image. Masks of another size
/// are ignored.
pub fn blend_labelmap(image: &mut ColorImage, mask: &Mask, color: Color32) -> bool {
    if image.size != [mask.width(), mask.height()] {
        log::debug!(
            "labelmap {}x{} does not match image {}x{}",
            mask.width(),
            mask.height(),
            image.size[0],
            image.size[1]
        );
        return false;
    }
    let blend = |base: u8, over: u8| -> u8 {
        (base as f32 * (1.0 - LABELMAP_OPACITY) + over as f32 * LABELMAP_OPACITY).round() as u8
    };
    let width = image.size[0];
    for (index, pixel) in image.pixels.iter_mut().enumerate() {
        if mask.get(index % width, index / width) {
            *pixel = Color32::from_rgb(
                blend(pixel.r(), color.r()),
                blend(pixel.g(), color.g()),
                blend(pixel.b(), color.b()),
            );
        }
    }
    true
}

/// Accepts `#rrggbb`, `rrggbb` and `rgb(r, g, b)`.
pub fn parse_color_code(code: &str) -> Option<Color32> {
    let code = code.trim();
    if let Some(inner) = code
        .strip_prefix("rgb(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let channels = inner
            .split(',')
            .map(|channel| channel.trim().parse::<u8>().ok())
            .collect::<Option<Vec<_>>>()?;
        return match channels.as_slice() {
            [r, g, b] => Some(Color32::from_rgb(*r, *g, *b)),
            _ => None,
        };
    }
    let hex = code.strip_prefix('#').unwrap_or(code);
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    Some(Color32::from_rgb(channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

pub fn to_pos(origin: Pos2, point: Point) -> Pos2 {
    pos2(origin.x + point.x, origin.y + point.y)
}

/// Textured quad whose corners follow the view transform, so rotation and
/// flips are applied by the GPU rather than by re-rendering the frame.
pub fn image_mesh(texture: TextureId, transform: &ViewTransform, origin: Pos2) -> Mesh {
    let corners = [
        (Point::new(0.0, 0.0), pos2(0.0, 0.0)),
        (Point::new(transform.image_width, 0.0), pos2(1.0, 0.0)),
        (
            Point::new(transform.image_width, transform.image_height),
            pos2(1.0, 1.0),
        ),
        (Point::new(0.0, transform.image_height), pos2(0.0, 1.0)),
    ];
    let mut mesh = Mesh::with_texture(texture);
    for (image_point, uv) in corners {
        let display = transform.image_to_display(image_point);
        mesh.vertices.push(eframe::egui::epaint::Vertex {
            pos: to_pos(origin, display),
            uv,
            color: Color32::WHITE,
        });
    }
    mesh.add_triangle(0, 1, 2);
    mesh.add_triangle(0, 2, 3);
    mesh
}

/// Outline of an annotation whose geometry is already in screen space.
/// Geometry shorter than the tool needs draws whatever it can.
pub fn annotation_outline(tool: ToolType, points: &[Pos2], stroke: Stroke) -> Vec<Shape> {
    match (tool, points) {
        (_, []) => Vec::new(),
        (ToolType::Probe, [center, ..]) => vec![
            Shape::circle_stroke(*center, PROBE_RADIUS, stroke),
            Shape::circle_filled(*center, 1.0, stroke.color),
        ],
        (ToolType::RectangleRoi, [a, b, ..]) => {
            vec![Shape::rect_stroke(Rect::from_two_pos(*a, *b), 0.0, stroke)]
        }
        (ToolType::EllipticalRoi, [a, b, ..]) => {
            vec![Shape::closed_line(ellipse_points(*a, *b), stroke)]
        }
        (ToolType::ArrowAnnotate, [tip, tail, ..]) => arrow(*tail, *tip, stroke),
        (ToolType::FreehandRoi, points) if points.len() > 2 => {
            vec![Shape::closed_line(points.to_vec(), stroke)]
        }
        (_, [single]) => vec![Shape::circle_filled(*single, 2.0, stroke.color)],
        (_, points) => vec![Shape::line(points.to_vec(), stroke)],
    }
}

fn ellipse_points(a: Pos2, b: Pos2) -> Vec<Pos2> {
    let bounds = Rect::from_two_pos(a, b);
    let center = bounds.center();
    let radius = bounds.size() / 2.0;
    (0..ELLIPSE_SEGMENTS)
        .map(|step| {
            let angle = step as f32 / ELLIPSE_SEGMENTS as f32 * std::f32::consts::TAU;
            pos2(
                center.x + radius.x * angle.cos(),
                center.y + radius.y * angle.sin(),
            )
        })
        .collect()
}

fn arrow(tail: Pos2, tip: Pos2, stroke: Stroke) -> Vec<Shape> {
    let direction = tip - tail;
    let length = direction.length();
    let mut shapes = vec![Shape::line_segment([tail, tip], stroke)];
    if length > f32::EPSILON {
        let unit = direction / length;
        let normal = vec2(-unit.y, unit.x);
        let back = tip - unit * ARROW_HEAD;
        shapes.push(Shape::line_segment([tip, back + normal * ARROW_HEAD * 0.5], stroke));
        shapes.push(Shape::line_segment([tip, back - normal * ARROW_HEAD * 0.5], stroke));
    }
    shapes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_level_clamps_and_inverts() {
        let image = render_window_level(3, 1, &[0, 50, 100], false, 50.0, 100.0);
        assert_eq!(image.pixels[0], Color32::from_gray(0));
        assert_eq!(image.pixels[1], Color32::from_gray(128));
        assert_eq!(image.pixels[2], Color32::from_gray(255));

        let inverted = render_window_level(1, 1, &[-500], true, 50.0, 100.0);
        assert_eq!(inverted.pixels[0], Color32::from_gray(255));
    }

    #[test]
    fn short_rgb_frames_are_padded_black() {
        let image = render_rgb(2, 2, &[10, 20, 30, 40, 50, 60], 3);
        assert_eq!(image.pixels.len(), 4);
        assert_eq!(image.pixels[1], Color32::from_rgb(40, 50, 60));
        assert_eq!(image.pixels[3], Color32::BLACK);
    }

    #[test]
    fn labelmap_tints_only_masked_pixels() {
        let mut image = render_window_level(4, 4, &[0; 16], false, 0.0, 1.0);
        let mut mask = Mask::new(4, 4);
        mask.paint_disc(Point::new(0.5, 0.5), 0.5, true);
        assert!(blend_labelmap(&mut image, &mask, Color32::from_rgb(200, 0, 0)));
        assert_eq!(image.pixels[0], Color32::from_rgb(90, 0, 0));
        assert_eq!(image.pixels[15], Color32::from_gray(0));

        assert!(!blend_labelmap(&mut image, &Mask::new(2, 2), Color32::RED));
    }

    #[test]
    fn color_codes_parse_in_both_notations() {
        assert_eq!(
            parse_color_code("#f5c518"),
            Some(Color32::from_rgb(0xf5, 0xc5, 0x18))
        );
        assert_eq!(
            parse_color_code("rgb(1, 2, 3)"),
            Some(Color32::from_rgb(1, 2, 3))
        );
        assert_eq!(parse_color_code("#fff"), None);
        assert_eq!(parse_color_code("rgb(1,2)"), None);
    }

    #[test]
    fn rotated_mesh_keeps_uv_corners() {
        let mut transform = ViewTransform::fit(10.0, 10.0, 100.0, 100.0);
        transform.rotation = 1;
        let mesh = image_mesh(TextureId::default(), &transform, pos2(0.0, 0.0));
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        // Image top-left lands on the display top-right after a clockwise turn.
        assert_eq!(mesh.vertices[0].uv, pos2(0.0, 0.0));
        assert!((mesh.vertices[0].pos.x - 100.0).abs() < 1e-3);
        assert!(mesh.vertices[0].pos.y.abs() < 1e-3);
    }

    #[test]
    fn outlines_follow_the_tool() {
        let stroke = Stroke::new(1.0, Color32::WHITE);
        let a = pos2(10.0, 10.0);
        let b = pos2(30.0, 20.0);
        assert_eq!(annotation_outline(ToolType::Length, &[], stroke).len(), 0);
        assert_eq!(annotation_outline(ToolType::Probe, &[a], stroke).len(), 2);
        assert_eq!(annotation_outline(ToolType::ArrowAnnotate, &[a, b], stroke).len(), 3);
        assert!(matches!(
            annotation_outline(ToolType::RectangleRoi, &[a, b], stroke).as_slice(),
            [Shape::Rect(_)]
        ));
        // Not enough points for a closed freehand outline yet.
        assert!(matches!(
            annotation_outline(ToolType::FreehandRoi, &[a, b], stroke).as_slice(),
            [Shape::Path(path)] if !path.closed
        ));
    }

    #[test]
    fn ellipse_stays_inside_its_box() {
        let points = ellipse_points(pos2(0.0, 0.0), pos2(40.0, 20.0));
        assert_eq!(points.len(), ELLIPSE_SEGMENTS);
        assert!(points
            .iter()
            .all(|p| (-1e-3..=40.001).contains(&p.x) && (-1e-3..=20.001).contains(&p.y)));
        assert!((points[0].x - 40.0).abs() < 1e-3);
    }
}
