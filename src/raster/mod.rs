// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Deterministic rasterization of shapes onto the shared canvas, and the
//! ink cost of each shape. The scanline algorithm here is the canonical
//! one: every miner must fill exactly the same cells for a given shape,
//! otherwise overlap detection stops converging across the network.

mod grid;
mod path;

pub use grid::{PixelArray, PixelSubArray};
pub use path::{parse_path, svg_to_points, SvgCommand, MAX_SVG_LEN};

use crate::primitives::{OpKind, ShapeOperation};
use lazy_static::lazy_static;
use regex::Regex;
use std::f64::consts::PI;
use std::fmt;

lazy_static! {
    static ref CIRCLE_RE: Regex =
        Regex::new(r"circle x:(\d+) y:(\d+) r:(\d+)").expect("circle regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterErr {
    /// The svg string exceeds [`MAX_SVG_LEN`].
    SvgTooLong(String),

    /// The svg string does not parse, or a filled path is not closed.
    InvalidSvg(String),

    /// A coordinate escapes the canvas.
    OutOfBounds,
}

impl fmt::Display for RasterErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterErr::SvgTooLong(svg) => write!(f, "svg string too long: {svg}"),
            RasterErr::InvalidSvg(svg) => write!(f, "invalid svg string: {svg}"),
            RasterErr::OutOfBounds => write!(f, "shape is out of canvas bounds"),
        }
    }
}

impl std::error::Error for RasterErr {}

/// A cell on the canvas. `moved` marks a pen move: no line is drawn from
/// the previous point to this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
    pub moved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlopeKind {
    PosRight,
    NegRight,
    PosLeft,
    NegLeft,
    InfUp,
    InfDown,
}

fn line_params(p1: Point, p2: Point) -> (SlopeKind, f64, f64) {
    if p1.x == p2.x {
        let kind = if p2.y > p1.y {
            SlopeKind::InfUp
        } else {
            SlopeKind::InfDown
        };
        (kind, 0.0, 0.0)
    } else {
        let slope = f64::from(p2.y - p1.y) / f64::from(p2.x - p1.x);
        let intercept = f64::from(p1.y) - slope * f64::from(p1.x);
        let kind = if p1.x < p2.x {
            if slope >= 0.0 {
                SlopeKind::PosRight
            } else {
                SlopeKind::NegRight
            }
        } else if slope >= 0.0 {
            SlopeKind::PosLeft
        } else {
            SlopeKind::NegLeft
        };
        (kind, slope, intercept)
    }
}

/// Walks the cells of a line, one cell per step, snapping y to the
/// rounded line equation at each x advance.
struct LinePoints {
    kind: SlopeKind,
    slope: f64,
    intercept: f64,
    x: f64,
    x_prev: i32,
    y: i32,
    y_thresh: i32,
    p2: Point,
}

/// Returns the cell iterator for the segment `p1 -> p2` plus its vertical
/// direction (-1, 0 or 1), which the parity fill keys off.
fn line_points(p1: Point, p2: Point) -> (LinePoints, i32) {
    let (kind, slope, intercept) = line_params(p1, p2);

    let vert_dir = match kind {
        SlopeKind::PosRight => i32::from(slope != 0.0),
        SlopeKind::PosLeft => {
            if slope == 0.0 {
                0
            } else {
                -1
            }
        }
        SlopeKind::NegRight | SlopeKind::InfDown => -1,
        SlopeKind::NegLeft | SlopeKind::InfUp => 1,
    };

    let x = f64::from(p1.x);
    let y_thresh = match kind {
        SlopeKind::NegRight | SlopeKind::PosLeft => (slope * x + intercept + 0.5) as i32,
        _ => 0,
    };

    let iter = LinePoints {
        kind,
        slope,
        intercept,
        x,
        x_prev: p1.x,
        y: p1.y,
        y_thresh,
        p2,
    };
    (iter, vert_dir)
}

impl LinePoints {
    fn advance_thresh(&mut self) {
        self.y_thresh = (self.slope * self.x + self.intercept + 0.5) as i32;
        self.x_prev = self.x as i32;
    }
}

impl Iterator for LinePoints {
    type Item = (i32, i32);

    fn next(&mut self) -> Option<(i32, i32)> {
        match self.kind {
            SlopeKind::PosRight => {
                if self.y < self.y_thresh {
                    if self.y > self.p2.y {
                        return None;
                    }
                    self.y += 1;
                } else {
                    if self.x as i32 > self.p2.x {
                        return None;
                    }
                    self.advance_thresh();
                    self.x += 1.0;
                    if self.y != self.y_thresh {
                        self.y += 1;
                    }
                }
                Some((self.x_prev, self.y))
            }
            SlopeKind::NegRight => {
                if self.y > self.y_thresh {
                    if self.y < self.p2.y {
                        return None;
                    }
                    self.y -= 1;
                } else {
                    if self.x as i32 > self.p2.x {
                        return None;
                    }
                    self.advance_thresh();
                    self.x += 1.0;
                    if self.y != self.y_thresh {
                        self.y -= 1;
                    }
                }
                Some((self.x_prev, self.y))
            }
            SlopeKind::PosLeft => {
                if self.y > self.y_thresh {
                    if self.y < self.p2.y {
                        return None;
                    }
                    self.y -= 1;
                } else {
                    if (self.x as i32) < self.p2.x {
                        return None;
                    }
                    self.advance_thresh();
                    self.x -= 1.0;
                    if self.y != self.y_thresh {
                        self.y -= 1;
                    }
                }
                Some((self.x_prev, self.y))
            }
            SlopeKind::NegLeft => {
                if self.y < self.y_thresh {
                    if self.y > self.p2.y {
                        return None;
                    }
                    self.y += 1;
                } else {
                    if (self.x as i32) < self.p2.x {
                        return None;
                    }
                    self.advance_thresh();
                    self.x -= 1.0;
                    if self.y != self.y_thresh {
                        self.y += 1;
                    }
                }
                Some((self.x_prev, self.y))
            }
            SlopeKind::InfUp => {
                if self.y > self.p2.y {
                    return None;
                }
                let y_prev = self.y;
                self.y += 1;
                Some((self.x as i32, y_prev))
            }
            SlopeKind::InfDown => {
                if self.y < self.p2.y {
                    return None;
                }
                let y_prev = self.y;
                self.y -= 1;
                Some((self.x as i32, y_prev))
            }
        }
    }
}

/// A polyline path. Closed shapes repeat their starting point as the last
/// point; `moved` points start a new sub-path.
#[derive(Debug, Clone)]
pub struct Path {
    pub points: Vec<Point>,
    pub filled: bool,
    pub stroke_filled: bool,
    x_min: i32,
    x_max: i32,
    y_min: i32,
    y_max: i32,
}

impl Path {
    #[must_use]
    pub fn new(points: Vec<Point>, filled: bool, stroke_filled: bool) -> Self {
        let first = points.first().copied().unwrap_or(Point {
            x: 0,
            y: 0,
            moved: false,
        });
        let (mut x_min, mut x_max, mut y_min, mut y_max) = (first.x, first.x, first.y, first.y);

        for p in points.iter().skip(1) {
            if p.x < x_min {
                x_min = p.x;
            } else if p.x > x_max {
                x_max = p.x;
            }
            if p.y < y_min {
                y_min = p.y;
            } else if p.y > y_max {
                y_max = p.y;
            }
        }

        Self {
            points,
            filled,
            stroke_filled,
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    fn has_interior_move(&self) -> bool {
        self.points.iter().skip(1).any(|p| p.moved)
    }

    /// Rasterizes the path. Interior fill runs first (parity toggled per
    /// scanline crossing), then the outline is stamped on top.
    #[must_use]
    pub fn sub_array(&self) -> PixelSubArray {
        let mut sub = PixelSubArray::new(self.x_min, self.x_max, self.y_min, self.y_max);
        if self.points.len() < 2 {
            if let Some(p) = self.points.first() {
                sub.set(p.x, p.y);
            }
            return sub;
        }

        if self.filled {
            let last = self.points[self.points.len() - 1];
            let mut prev_vert_dir = -2;
            let mut y_start = self.points[0].y;
            let mut y_prev = 0;

            // Parity of crossings through the sub-path's start row; must
            // come out even once the sub-path closes.
            let mut y_start_fill_count = 0;

            for i in 0..self.points.len() - 1 {
                if self.points[i + 1].moved {
                    if y_start_fill_count % 2 == 1 {
                        sub.flip_all_right(last.x, y_prev);
                    }
                    y_start_fill_count = 0;
                    y_start = self.points[i + 1].y;
                    prev_vert_dir = -2;
                    continue;
                }

                y_prev = self.points[i].y;

                let (iter, vert_dir) = line_points(self.points[i], self.points[i + 1]);

                if prev_vert_dir != vert_dir && prev_vert_dir != 0 {
                    sub.flip_all_right(self.points[i].x, y_prev);
                    if y_prev == y_start {
                        y_start_fill_count += 1;
                    }
                }
                prev_vert_dir = vert_dir;

                for (x, y) in iter {
                    if y != y_prev {
                        if vert_dir != 0 {
                            sub.flip_all_right(x, y);
                            if y == y_start {
                                y_start_fill_count += 1;
                            }
                        }
                        y_prev = y;
                    }
                }
            }

            if y_start_fill_count % 2 == 1 {
                sub.flip_all_right(last.x, y_prev);
            }
        }

        for i in 0..self.points.len() - 1 {
            if self.points[i + 1].moved {
                continue;
            }

            let (iter, _) = line_points(self.points[i], self.points[i + 1]);
            let mut y_prev = self.points[i].y;

            for (x, y) in iter {
                if y != y_prev {
                    // Keep diagonal lines continuous.
                    sub.set(x, y_prev);
                    y_prev = y;
                }
                sub.set(x, y);
            }
        }

        sub
    }

    /// Euclidean length of all drawn segments, rounded.
    #[must_use]
    pub fn total_length(&self) -> u32 {
        let mut sum = 0f64;
        for w in self.points.windows(2) {
            if w[1].moved {
                continue;
            }
            let dx = f64::from(w[1].x - w[0].x);
            let dy = f64::from(w[1].y - w[0].y);
            sum += (dx * dx + dy * dy).sqrt();
        }
        (sum + 0.5) as u32
    }

    /// Absolute polygon area via the shoelace formula. Undefined when the
    /// path contains interior moves.
    #[must_use]
    pub fn area(&self) -> u32 {
        let mut sum = 0f64;
        for w in self.points.windows(2) {
            sum += 0.5
                * (f64::from(w[0].x) * f64::from(w[1].y) - f64::from(w[1].x) * f64::from(w[0].y));
        }
        (sum.abs() + 0.5) as u32
    }

    /// Shoelace area plus outline length, rounded once at the end.
    #[must_use]
    pub fn area_plus_perim(&self) -> u32 {
        let mut sum = 0f64;
        for w in self.points.windows(2) {
            let dx = f64::from(w[1].x - w[0].x);
            let dy = f64::from(w[1].y - w[0].y);
            sum += (dx * dx + dy * dy).sqrt();
            sum += 0.5
                * (f64::from(w[0].x) * f64::from(w[1].y) - f64::from(w[1].x) * f64::from(w[0].y));
        }
        (sum.abs() + 0.5) as u32
    }

    /// The cells this path covers together with its ink cost:
    /// - unfilled: rounded path length,
    /// - filled, single sub-path: shoelace area (plus perimeter when the
    ///   stroke is painted too),
    /// - filled with interior moves: count of rasterized cells, since the
    ///   shoelace formula is undefined there.
    #[must_use]
    pub fn sub_array_and_cost(&self) -> (PixelSubArray, u32) {
        let sub = self.sub_array();

        if !self.filled {
            let cost = self.total_length();
            return (sub, cost);
        }

        if self.has_interior_move() {
            let cost = sub.pixels_filled();
            (sub, cost)
        } else if self.stroke_filled {
            let cost = self.area_plus_perim();
            (sub, cost)
        } else {
            let cost = self.area();
            (sub, cost)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Circle {
    pub c: Point,
    pub r: i32,
    pub filled: bool,
    pub stroke_filled: bool,
}

impl Circle {
    #[must_use]
    pub fn new(xc: i32, yc: i32, radius: i32, filled: bool, stroke_filled: bool) -> Self {
        Self {
            c: Point {
                x: xc,
                y: yc,
                moved: false,
            },
            r: radius,
            filled,
            stroke_filled,
        }
    }

    #[must_use]
    pub fn circumference(&self) -> u32 {
        (PI * f64::from(self.r) * 2.0 + 0.5) as u32
    }

    #[must_use]
    pub fn area(&self) -> u32 {
        let r = f64::from(self.r);
        (PI * r * r + 0.5) as u32
    }

    #[must_use]
    pub fn area_plus_circ(&self) -> u32 {
        let r = f64::from(self.r);
        (2.0 * PI * r + PI * r * r + 0.5) as u32
    }

    /// Rasterizes the circle by scanning rows outward from the center and
    /// snapping x to the rounded circle equation.
    #[must_use]
    pub fn sub_array(&self) -> PixelSubArray {
        let mut sub = PixelSubArray::new(
            self.c.x - self.r,
            self.c.x + self.r,
            self.c.y - self.r,
            self.c.y + self.r,
        );

        let mut x_len_prev = self.r;
        let r_squared = f64::from(self.r) * f64::from(self.r);

        for y_len in 0..=self.r {
            let x_len = ((r_squared - f64::from(y_len) * f64::from(y_len)).sqrt() + 0.5) as i32;

            sub.set(self.c.x + x_len, self.c.y + y_len);
            sub.set(self.c.x + x_len, self.c.y - y_len);
            sub.set(self.c.x - x_len, self.c.y - y_len);
            sub.set(self.c.x - x_len, self.c.y + y_len);

            if self.filled {
                let x_len_fill = x_len_prev - 1;
                sub.fill_between(self.c.x - x_len_fill, self.c.x + x_len_fill, self.c.y + y_len);
                sub.fill_between(self.c.x - x_len_fill, self.c.x + x_len_fill, self.c.y - y_len);
            }

            while x_len_prev > x_len {
                sub.set(self.c.x + x_len_prev, self.c.y + y_len);
                sub.set(self.c.x + x_len_prev, self.c.y - y_len);
                sub.set(self.c.x - x_len_prev, self.c.y - y_len);
                sub.set(self.c.x - x_len_prev, self.c.y + y_len);
                x_len_prev -= 1;
            }
        }

        sub
    }

    #[must_use]
    pub fn sub_array_and_cost(&self) -> (PixelSubArray, u32) {
        let sub = self.sub_array();

        let cost = if self.filled {
            if self.stroke_filled {
                self.area_plus_circ()
            } else {
                self.area()
            }
        } else {
            self.circumference()
        };

        (sub, cost)
    }
}

#[derive(Debug, Clone)]
pub enum Shape {
    Path(Path),
    Circle(Circle),
}

impl Shape {
    #[must_use]
    pub fn sub_array_and_cost(&self) -> (PixelSubArray, u32) {
        match self {
            Shape::Path(p) => p.sub_array_and_cost(),
            Shape::Circle(c) => c.sub_array_and_cost(),
        }
    }
}

/// Builds the shape described by an operation, checked against the canvas
/// dimensions. Path syntax is tried first; strings that are not paths fall
/// back to the circle descriptor, and if neither matches the path error is
/// the one reported.
pub fn shape_from_op(
    op: &ShapeOperation,
    canvas_x: u32,
    canvas_y: u32,
) -> Result<Shape, RasterErr> {
    match parse_path(&op.svg) {
        Ok(commands) => {
            let points = svg_to_points(&commands, canvas_x as i32, canvas_y as i32, op.filled())?;
            Ok(Shape::Path(Path::new(points, op.filled(), op.stroked())))
        }
        Err(path_err) => match circle_from_op(op, canvas_x, canvas_y) {
            Ok(circle) => Ok(Shape::Circle(circle)),
            Err(RasterErr::OutOfBounds) => Err(RasterErr::OutOfBounds),
            Err(_) => Err(path_err),
        },
    }
}

/// Parses the `circle x:<u> y:<u> r:<u>` descriptor.
fn circle_from_op(op: &ShapeOperation, canvas_x: u32, canvas_y: u32) -> Result<Circle, RasterErr> {
    if !op.filled() && !op.stroked() {
        return Err(RasterErr::InvalidSvg(op.svg.clone()));
    }

    let caps = CIRCLE_RE
        .captures(&op.svg)
        .ok_or_else(|| RasterErr::InvalidSvg(op.svg.clone()))?;

    let number = |i: usize| -> Result<i64, RasterErr> {
        caps[i]
            .parse::<i64>()
            .map_err(|_| RasterErr::InvalidSvg(op.svg.clone()))
    };
    let (x, y, r) = (number(1)?, number(2)?, number(3)?);

    if x + r > i64::from(canvas_x) || y + r > i64::from(canvas_y) || x - r < 0 || y - r < 0 {
        return Err(RasterErr::OutOfBounds);
    }

    Ok(Circle::new(
        x as i32,
        y as i32,
        r as i32,
        op.filled(),
        op.stroked(),
    ))
}

/// Renders an operation as an HTML svg element for canvas viewers.
/// Deletions paint white so they visually erase the original shape.
#[must_use]
pub fn html_svg(op: &ShapeOperation) -> String {
    let (fill, stroke) = if op.kind == OpKind::Delete {
        ("white", "white")
    } else {
        (op.fill.as_str(), op.stroke.as_str())
    };

    if let Some(caps) = CIRCLE_RE.captures(&op.svg) {
        format!(
            "<circle cx=\"{}\" cy=\"{}\" r=\"{}\" fill=\"{}\" stroke=\"{}\"/>",
            &caps[1], &caps[2], &caps[3], fill, stroke
        )
    } else {
        format!(
            "<path d=\"{}\" fill=\"{}\" fill-rule=\"evenodd\" stroke=\"{}\"/>",
            op.svg, fill, stroke
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{OpKind, TRANSPARENT};

    fn op(svg: &str, fill: &str, stroke: &str) -> ShapeOperation {
        ShapeOperation {
            kind: OpKind::Add,
            svg: svg.to_owned(),
            fill: fill.to_owned(),
            stroke: stroke.to_owned(),
            op_num: 0,
        }
    }

    #[test]
    fn line_cost_is_rounded_length() {
        let shape = shape_from_op(&op("M 0 0 L 0 5", TRANSPARENT, "red"), 100, 100).unwrap();
        let (_, cost) = shape.sub_array_and_cost();
        assert_eq!(cost, 5);

        let diagonal = shape_from_op(&op("M 0 0 L 3 4", TRANSPARENT, "red"), 100, 100).unwrap();
        let (_, cost) = diagonal.sub_array_and_cost();
        assert_eq!(cost, 5);
    }

    #[test]
    fn filled_polygon_cost_is_shoelace_area() {
        let shape =
            shape_from_op(&op("M 0 0 L 0 4 L 4 4 Z", "red", TRANSPARENT), 100, 100).unwrap();
        let (_, cost) = shape.sub_array_and_cost();
        assert_eq!(cost, 8);
    }

    #[test]
    fn filled_and_stroked_adds_perimeter() {
        let shape = shape_from_op(&op("M 0 0 L 0 4 L 4 4 Z", "red", "blue"), 100, 100).unwrap();
        let (_, cost) = shape.sub_array_and_cost();
        // Signed area (-8) plus the three segment lengths, abs, rounded.
        assert_eq!(cost, 6);
    }

    #[test]
    fn filled_multi_subpath_counts_cells() {
        let svg = "M 0 0 h 2 v 2 h -2 v -2 M 8 8 h 2 v 2 h -2 v -2";
        let shape = shape_from_op(&op(svg, "red", TRANSPARENT), 100, 100).unwrap();
        let (sub, cost) = shape.sub_array_and_cost();
        assert_eq!(cost, sub.pixels_filled());
        assert!(cost > 0);
    }

    #[test]
    fn circle_costs() {
        let outline = shape_from_op(&op("circle x:10 y:10 r:3", TRANSPARENT, "red"), 100, 100)
            .unwrap();
        let (_, cost) = outline.sub_array_and_cost();
        assert_eq!(cost, 19); // round(2 * pi * 3)

        let filled =
            shape_from_op(&op("circle x:10 y:10 r:3", "red", TRANSPARENT), 100, 100).unwrap();
        let (_, cost) = filled.sub_array_and_cost();
        assert_eq!(cost, 28); // round(pi * 9)

        let both = shape_from_op(&op("circle x:10 y:10 r:3", "red", "red"), 100, 100).unwrap();
        let (_, cost) = both.sub_array_and_cost();
        assert_eq!(cost, 47); // round(pi * 9 + 2 * pi * 3)
    }

    #[test]
    fn fully_transparent_circle_is_invalid() {
        let result = shape_from_op(
            &op("circle x:10 y:10 r:3", TRANSPARENT, TRANSPARENT),
            100,
            100,
        );
        assert!(matches!(result, Err(RasterErr::InvalidSvg(_))));
    }

    #[test]
    fn circle_bounding_box_must_fit() {
        let escapes = shape_from_op(&op("circle x:2 y:10 r:3", TRANSPARENT, "red"), 100, 100);
        assert!(matches!(escapes, Err(RasterErr::OutOfBounds)));

        let fits = shape_from_op(&op("circle x:3 y:10 r:3", TRANSPARENT, "red"), 100, 100);
        assert!(fits.is_ok());
    }

    #[test]
    fn overlapping_lines_conflict() {
        let (a, _) = shape_from_op(&op("M 0 0 L 0 5", TRANSPARENT, "red"), 100, 100)
            .unwrap()
            .sub_array_and_cost();
        let (b, _) = shape_from_op(&op("M 0 1 L 0 4", TRANSPARENT, "red"), 100, 100)
            .unwrap()
            .sub_array_and_cost();
        let (c, _) = shape_from_op(&op("M 5 0 L 5 5", TRANSPARENT, "red"), 100, 100)
            .unwrap()
            .sub_array_and_cost();

        let mut canvas = PixelArray::new(100, 100);
        canvas.merge_sub_array(&a);
        assert!(canvas.has_conflict(&b));
        assert!(!canvas.has_conflict(&c));
    }

    #[test]
    fn raster_is_deterministic() {
        let make = || {
            shape_from_op(&op("M 1 1 L 6 3 L 2 8 Z", "red", "red"), 100, 100)
                .unwrap()
                .sub_array_and_cost()
        };
        let (a, cost_a) = make();
        let (b, cost_b) = make();
        assert_eq!(cost_a, cost_b);
        assert_eq!(a.pixels_filled(), b.pixels_filled());
        let mut canvas = PixelArray::new(100, 100);
        canvas.merge_sub_array(&a);
        assert!(canvas.has_conflict(&b));
    }

    #[test]
    fn html_rendering() {
        let add = op("M 0 0 L 0 5", TRANSPARENT, "red");
        assert_eq!(
            html_svg(&add),
            "<path d=\"M 0 0 L 0 5\" fill=\"transparent\" fill-rule=\"evenodd\" stroke=\"red\"/>"
        );

        let mut del = op("circle x:1 y:2 r:3", "red", "blue");
        del.kind = OpKind::Delete;
        assert_eq!(
            html_svg(&del),
            "<circle cx=\"1\" cy=\"2\" r=\"3\" fill=\"white\" stroke=\"white\"/>"
        );
    }
}
