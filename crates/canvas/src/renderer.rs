//! Deterministic A2UI rasteriser.
//!
//! Flattens the scene into an 8-bit grayscale bitmap and regenerates the
//! hit-target list on every render. The rasteriser itself is single-threaded
//! per render; the handler serialises `render` against `hit_test`.

use {
    embedded_graphics::{
        mono_font::{ascii::FONT_7X13, MonoTextStyle},
        pixelcolor::Gray8,
        prelude::*,
        primitives::{PrimitiveStyleBuilder, Rectangle, StrokeAlignment},
        text::Text,
    },
    image::GrayImage,
};

use crate::a2ui::{Action, Align, Component, ComponentKind};

const BACKGROUND_GRAY: u8 = 255;
const DEFAULT_FILL_GRAY: u8 = 230;
const DEFAULT_STROKE_GRAY: u8 = 80;
const TEXT_GRAY: u8 = 20;
const TEXT_PADDING: i32 = 2;

/// Rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Touchable region plus the action it triggers.
#[derive(Debug, Clone)]
pub struct HitTarget {
    pub rect: Rect,
    pub action: Action,
}

pub struct Renderer {
    width: u32,
    height: u32,
    image: GrayImage,
    hit_targets: Vec<HitTarget>,
}

impl Renderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            image: GrayImage::new(width, height),
            hit_targets: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn hit_targets(&self) -> &[HitTarget] {
        &self.hit_targets
    }

    /// Whiten the canvas and drop all hit-targets.
    pub fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = image::Luma([BACKGROUND_GRAY]);
        }
        self.hit_targets.clear();
    }

    /// Rasterise the scene in push order onto a fresh background.
    pub fn render(&mut self, components: &[Component]) {
        self.clear();
        for component in components {
            self.render_component(component, 0, 0);
        }
    }

    /// First hit-target containing the point, in insertion order.
    pub fn hit_test(&self, x: i32, y: i32) -> Option<&Action> {
        self.hit_targets
            .iter()
            .find(|target| target.rect.contains(x, y))
            .map(|target| &target.action)
    }

    fn render_component(&mut self, component: &Component, offset_x: i32, offset_y: i32) {
        let x = offset_x + component.x;
        let y = offset_y + component.y;
        // Non-positive extent means "fill to the canvas edge".
        let width = if component.width > 0 {
            component.width
        } else {
            self.width as i32 - x
        };
        let height = if component.height > 0 {
            component.height
        } else {
            self.height as i32 - y
        };
        let rect = Rect {
            x,
            y,
            width,
            height,
        };

        match component.kind {
            ComponentKind::Box | ComponentKind::Card | ComponentKind::Button => {
                let style = component.style.unwrap_or_default();
                self.fill_and_stroke(
                    rect,
                    style.fill_gray.unwrap_or(DEFAULT_FILL_GRAY),
                    style.stroke_gray.unwrap_or(DEFAULT_STROKE_GRAY),
                );
            },
            ComponentKind::Text => self.draw_text(&component.text, rect, component.align),
            ComponentKind::List => {},
        }

        if let Some(action) = &component.action {
            if !rect.is_empty() {
                self.hit_targets.push(HitTarget {
                    rect,
                    action: action.clone(),
                });
            }
        }

        if component.children.is_empty() {
            return;
        }
        if component.kind == ComponentKind::List {
            // Children stack vertically; x is indented by the list padding
            // and a zero y places the child at the running cursor.
            let mut cursor_y = y + component.padding;
            for child in &component.children {
                let mut child = child.clone();
                if child.y == 0 {
                    child.y = cursor_y - y;
                }
                child.x += component.padding;
                self.render_component(&child, x, y);
                cursor_y += child.height + component.padding;
            }
            return;
        }
        for child in &component.children {
            self.render_component(child, x, y);
        }
    }

    fn fill_and_stroke(&mut self, rect: Rect, fill: u8, stroke: u8) {
        if rect.is_empty() {
            return;
        }
        let style = PrimitiveStyleBuilder::new()
            .fill_color(Gray8::new(fill))
            .stroke_color(Gray8::new(stroke))
            .stroke_width(1)
            .stroke_alignment(StrokeAlignment::Inside)
            .build();
        let shape = Rectangle::new(
            Point::new(rect.x, rect.y),
            Size::new(rect.width as u32, rect.height as u32),
        );
        let _ = shape.into_styled(style).draw(&mut Surface {
            image: &mut self.image,
        });
    }

    fn draw_text(&mut self, text: &str, rect: Rect, align: Align) {
        if text.is_empty() {
            return;
        }
        let style = MonoTextStyle::new(&FONT_7X13, Gray8::new(TEXT_GRAY));
        let glyph_advance =
            (FONT_7X13.character_size.width + FONT_7X13.character_spacing) as i32;
        let measured = glyph_advance * text.chars().count() as i32;
        let start_x = match align {
            Align::Left => rect.x + TEXT_PADDING,
            Align::Center => rect.x + (rect.width - measured) / 2,
            Align::Right => rect.x + rect.width - measured - TEXT_PADDING,
        };
        let baseline_y = rect.y + FONT_7X13.baseline as i32 + 2;
        let _ = Text::new(text, Point::new(start_x, baseline_y), style).draw(&mut Surface {
            image: &mut self.image,
        });
    }
}

/// embedded-graphics draw target over the gray bitmap. Out-of-bounds pixels
/// are dropped, which also clips oversized component rects.
struct Surface<'a> {
    image: &'a mut GrayImage,
}

impl OriginDimensions for Surface<'_> {
    fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

impl DrawTarget for Surface<'_> {
    type Color = Gray8;
    type Error = std::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let width = self.image.width() as i32;
        let height = self.image.height() as i32;
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 && point.x < width && point.y < height {
                self.image
                    .put_pixel(point.x as u32, point.y as u32, image::Luma([color.luma()]));
            }
        }
        Ok(())
    }
}
