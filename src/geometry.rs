use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned rectangle stored as min/max corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Point,
    pub max: Point,
}

impl Bounds {
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = *points.first()?;
        let mut bounds = Self {
            min: first,
            max: first,
        };
        for point in &points[1..] {
            bounds.min.x = bounds.min.x.min(point.x);
            bounds.min.y = bounds.min.y.min(point.y);
            bounds.max.x = bounds.max.x.max(point.x);
            bounds.max.y = bounds.max.y.max(point.y);
        }
        Some(bounds)
    }

    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            min: Point::new(a.x.min(b.x), a.y.min(b.y)),
            max: Point::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    pub fn expand(&self, padding: f32) -> Self {
        Self {
            min: Point::new(self.min.x - padding, self.min.y - padding),
            max: Point::new(self.max.x + padding, self.max.y + padding),
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
    }

    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn corners(&self) -> [Point; 4] {
        [
            self.min,
            Point::new(self.max.x, self.min.y),
            self.max,
            Point::new(self.min.x, self.max.y),
        ]
    }
}

/// Maps image-space coordinates into the display space of one viewport element
/// (origin at the element's top-left corner) and back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub image_width: f32,
    pub image_height: f32,
    pub viewport_width: f32,
    pub viewport_height: f32,
    pub zoom: f32,
    pub pan: Point,
    /// Clockwise quarter turns, always in `0..4`.
    pub rotation: u8,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl ViewTransform {
    pub fn fit(
        image_width: f32,
        image_height: f32,
        viewport_width: f32,
        viewport_height: f32,
    ) -> Self {
        Self {
            image_width,
            image_height,
            viewport_width,
            viewport_height,
            zoom: 1.0,
            pan: Point::default(),
            rotation: 0,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }

    fn rotated_image_size(&self) -> (f32, f32) {
        if self.rotation % 2 == 1 {
            (self.image_height, self.image_width)
        } else {
            (self.image_width, self.image_height)
        }
    }

    pub fn scale(&self) -> f32 {
        let (width, height) = self.rotated_image_size();
        if width <= 0.0 || height <= 0.0 {
            return 1.0;
        }
        let fit = (self.viewport_width / width)
            .min(self.viewport_height / height)
            .max(0.01);
        fit * self.zoom
    }

    fn display_center(&self) -> Point {
        Point::new(
            self.viewport_width * 0.5 + self.pan.x,
            self.viewport_height * 0.5 + self.pan.y,
        )
    }

    pub fn image_to_display(&self, point: Point) -> Point {
        let mut x = point.x - self.image_width * 0.5;
        let mut y = point.y - self.image_height * 0.5;
        if self.flip_horizontal {
            x = -x;
        }
        if self.flip_vertical {
            y = -y;
        }
        for _ in 0..self.rotation % 4 {
            (x, y) = (-y, x);
        }
        let scale = self.scale();
        let center = self.display_center();
        Point::new(center.x + x * scale, center.y + y * scale)
    }

    pub fn display_to_image(&self, point: Point) -> Point {
        let scale = self.scale();
        let center = self.display_center();
        let mut x = (point.x - center.x) / scale;
        let mut y = (point.y - center.y) / scale;
        for _ in 0..self.rotation % 4 {
            (x, y) = (y, -x);
        }
        if self.flip_vertical {
            y = -y;
        }
        if self.flip_horizontal {
            x = -x;
        }
        Point::new(x + self.image_width * 0.5, y + self.image_height * 0.5)
    }

    /// Display-space bounding box of an image-space rectangle.
    pub fn bounds_to_display(&self, bounds: &Bounds) -> Bounds {
        let corners = bounds.corners().map(|corner| self.image_to_display(corner));
        // Four corners are always present.
        Bounds::from_points(&corners).unwrap_or(*bounds)
    }
}
