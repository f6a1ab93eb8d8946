// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Parser for the SVG path subset. Grammar (tokens separated by single
//! spaces): an initial absolute `M x y`, then any mix of `L x y`,
//! `l dx dy`, `H x`, `h dx`, `V y`, `v dy` and `Z`.

use crate::raster::{Point, RasterErr};

/// Longest accepted svg string, in characters.
pub const MAX_SVG_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvgCommand {
    /// Always absolute; the grammar has no cursor to make `m` meaningful.
    Move { x: i32, y: i32 },
    Line { x: i32, y: i32, relative: bool },
    Horizontal { x: i32, relative: bool },
    Vertical { y: i32, relative: bool },
    /// Close: line back to the first point of the path.
    Close,
}

/// Tokenizes an svg string into commands.
pub fn parse_path(svg: &str) -> Result<Vec<SvgCommand>, RasterErr> {
    if svg.len() > MAX_SVG_LEN {
        return Err(RasterErr::SvgTooLong(svg.to_owned()));
    }

    let invalid = || RasterErr::InvalidSvg(svg.to_owned());
    let tokens: Vec<&str> = svg.split(' ').collect();
    let number = |idx: usize| -> Result<i32, RasterErr> {
        tokens
            .get(idx)
            .ok_or_else(|| RasterErr::InvalidSvg(svg.to_owned()))?
            .parse::<i32>()
            .map_err(|_| RasterErr::InvalidSvg(svg.to_owned()))
    };

    let mut commands = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i];

        if i == 0 && !token.eq_ignore_ascii_case("M") {
            return Err(invalid());
        }

        match token {
            "M" | "m" => {
                commands.push(SvgCommand::Move {
                    x: number(i + 1)?,
                    y: number(i + 2)?,
                });
                i += 3;
            }
            "L" | "l" => {
                commands.push(SvgCommand::Line {
                    x: number(i + 1)?,
                    y: number(i + 2)?,
                    relative: token == "l",
                });
                i += 3;
            }
            "H" | "h" => {
                commands.push(SvgCommand::Horizontal {
                    x: number(i + 1)?,
                    relative: token == "h",
                });
                i += 2;
            }
            "V" | "v" => {
                commands.push(SvgCommand::Vertical {
                    y: number(i + 1)?,
                    relative: token == "v",
                });
                i += 2;
            }
            "Z" | "z" => {
                commands.push(SvgCommand::Close);
                i += 1;
            }
            _ => return Err(invalid()),
        }
    }

    Ok(commands)
}

/// Resolves commands into absolute points. Checks canvas bounds, and when
/// `filled` requires every sub-path delimited by a `Move` to be closed
/// (its last point equal to its starting point).
pub fn svg_to_points(
    commands: &[SvgCommand],
    canvas_x: i32,
    canvas_y: i32,
    filled: bool,
) -> Result<Vec<Point>, RasterErr> {
    let mut points: Vec<Point> = Vec::with_capacity(commands.len());

    for command in commands {
        let prev = points.last().copied();
        let point = match *command {
            SvgCommand::Move { x, y } => Point { x, y, moved: true },
            SvgCommand::Line { x, y, relative } => {
                let base = prev.ok_or(RasterErr::InvalidSvg(String::new()))?;
                if relative {
                    Point {
                        x: base.x + x,
                        y: base.y + y,
                        moved: false,
                    }
                } else {
                    Point { x, y, moved: false }
                }
            }
            SvgCommand::Horizontal { x, relative } => {
                let base = prev.ok_or(RasterErr::InvalidSvg(String::new()))?;
                Point {
                    x: if relative { base.x + x } else { x },
                    y: base.y,
                    moved: false,
                }
            }
            SvgCommand::Vertical { y, relative } => {
                let base = prev.ok_or(RasterErr::InvalidSvg(String::new()))?;
                Point {
                    x: base.x,
                    y: if relative { base.y + y } else { y },
                    moved: false,
                }
            }
            SvgCommand::Close => {
                let first = points.first().ok_or(RasterErr::InvalidSvg(String::new()))?;
                Point {
                    x: first.x,
                    y: first.y,
                    moved: false,
                }
            }
        };

        if point.x > canvas_x || point.y > canvas_y || point.x < 0 || point.y < 0 {
            return Err(RasterErr::OutOfBounds);
        }

        points.push(point);
    }

    // The leading move carries no pen stroke.
    if let Some(first) = points.first_mut() {
        first.moved = false;
    }

    let has_interior_move = points.iter().skip(1).any(|p| p.moved);

    if filled {
        if points.is_empty() {
            return Err(RasterErr::InvalidSvg(String::new()));
        }
        if !has_interior_move {
            let first = points[0];
            let last = points[points.len() - 1];
            if first.x != last.x || first.y != last.y {
                return Err(RasterErr::InvalidSvg(String::new()));
            }
        } else {
            // Each sub-path between moves must individually close.
            let mut start = points[0];
            let mut prev = points[0];
            for point in &points {
                if point.moved {
                    if start.x != prev.x || start.y != prev.y {
                        return Err(RasterErr::InvalidSvg(String::new()));
                    }
                    start = *point;
                }
                prev = *point;
            }
            if start.x != prev.x || start.y != prev.y {
                return Err(RasterErr::InvalidSvg(String::new()));
            }
        }
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_token_must_be_move() {
        assert!(matches!(
            parse_path("L 0 5"),
            Err(RasterErr::InvalidSvg(_))
        ));
        assert!(parse_path("M 0 0 L 0 5").is_ok());
    }

    #[test]
    fn length_boundary() {
        // Exactly 128 characters parses.
        let mut svg = "M 0 0".to_owned();
        for _ in 0..29 {
            svg.push_str(" h 1");
        }
        svg.push_str(" h 10 Z");
        assert_eq!(svg.len(), 128);
        assert!(parse_path(&svg).is_ok());

        // 129 fails the length check before anything else is looked at.
        svg.push('1');
        assert!(matches!(parse_path(&svg), Err(RasterErr::SvgTooLong(_))));
    }

    #[test]
    fn bad_numeric_is_invalid() {
        assert!(matches!(
            parse_path("M 0 zero"),
            Err(RasterErr::InvalidSvg(_))
        ));
        assert!(matches!(parse_path("M 0"), Err(RasterErr::InvalidSvg(_))));
    }

    #[test]
    fn relative_commands_accumulate() {
        let cmds = parse_path("M 5 5 l 2 3 h -1 v 4").unwrap();
        let points = svg_to_points(&cmds, 100, 100, false).unwrap();
        assert_eq!(
            points.iter().map(|p| (p.x, p.y)).collect::<Vec<_>>(),
            vec![(5, 5), (7, 8), (6, 8), (6, 12)]
        );
    }

    #[test]
    fn lowercase_v_is_vertical() {
        let cmds = parse_path("M 3 3 v 5").unwrap();
        let points = svg_to_points(&cmds, 100, 100, false).unwrap();
        assert_eq!((points[1].x, points[1].y), (3, 8));
    }

    #[test]
    fn bounds_are_inclusive() {
        let cmds = parse_path("M 0 0 L 10 10").unwrap();
        assert!(svg_to_points(&cmds, 10, 10, false).is_ok());
        assert!(matches!(
            svg_to_points(&cmds, 9, 10, false),
            Err(RasterErr::OutOfBounds)
        ));

        let negative = parse_path("M 2 2 l -3 0").unwrap();
        assert!(matches!(
            svg_to_points(&negative, 10, 10, false),
            Err(RasterErr::OutOfBounds)
        ));
    }

    #[test]
    fn filled_path_must_close() {
        let open = parse_path("M 0 0 L 0 5 L 5 5").unwrap();
        assert!(matches!(
            svg_to_points(&open, 10, 10, true),
            Err(RasterErr::InvalidSvg(_))
        ));

        let closed = parse_path("M 0 0 L 0 5 L 5 5 Z").unwrap();
        assert!(svg_to_points(&closed, 10, 10, true).is_ok());
    }

    #[test]
    fn filled_multi_subpath_closure() {
        // Both squares close onto their own move start.
        let ok = parse_path("M 0 0 h 2 v 2 h -2 v -2 M 4 4 h 2 v 2 h -2 v -2").unwrap();
        assert!(svg_to_points(&ok, 10, 10, true).is_ok());

        let bad = parse_path("M 0 0 h 2 v 2 h -2 M 4 4 h 2 v 2 h -2 v -2").unwrap();
        assert!(matches!(
            svg_to_points(&bad, 10, 10, true),
            Err(RasterErr::InvalidSvg(_))
        ));
    }
}
