//! Greedy two-column masonry balancing for board and canvas grids.

use serde::{Deserialize, Serialize};

/// Width / height used when an item has no usable aspect ratio.
pub const DEFAULT_ASPECT_RATIO: f32 = 1.0;
pub const DEFAULT_COLUMN_COUNT: usize = 2;
pub const DEFAULT_SPACING: f32 = 8.0;

pub trait MasonryItem {
    /// Raw aspect ratio as stored by the backend, e.g. `"16:9"`.
    fn aspect_ratio(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTile {
    pub id: String,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
}

impl MasonryItem for MediaTile {
    fn aspect_ratio(&self) -> Option<&str> {
        self.aspect_ratio.as_deref()
    }
}

impl MasonryItem for Option<String> {
    fn aspect_ratio(&self) -> Option<&str> {
        self.as_deref()
    }
}

/// Parses `"w:h"`, `"w/h"` or a plain decimal into width / height.
pub fn parse_aspect_ratio(raw: &str) -> Option<f32> {
    let raw = raw.trim();
    let ratio = match raw.split_once(&[':', '/'][..]) {
        Some((width, height)) => {
            let width = width.trim().parse::<f32>().ok()?;
            let height = height.trim().parse::<f32>().ok()?;
            width / height
        }
        None => raw.parse::<f32>().ok()?,
    };
    (ratio.is_finite() && ratio > 0.0).then_some(ratio)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasonryColumn {
    /// Indexes into the arranged slice, in input order.
    pub items: Vec<usize>,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasonryColumns {
    pub columns: Vec<MasonryColumn>,
}

impl MasonryColumns {
    pub fn column_of(&self, item: usize) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.items.contains(&item))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasonryLayout {
    column_count: usize,
    column_width: f32,
    spacing: f32,
}

impl MasonryLayout {
    pub fn new(column_width: f32, spacing: f32) -> Self {
        Self {
            column_count: DEFAULT_COLUMN_COUNT,
            column_width,
            spacing,
        }
    }

    pub fn with_columns(mut self, column_count: usize) -> Self {
        self.column_count = column_count.max(1);
        self
    }

    pub fn item_height(&self, aspect_ratio: Option<&str>) -> f32 {
        let ratio = aspect_ratio
            .and_then(parse_aspect_ratio)
            .unwrap_or(DEFAULT_ASPECT_RATIO);
        self.column_width / ratio
    }

    /// Places each item, in order, into the currently shortest column. Ties go
    /// to the leftmost column.
    pub fn arrange<T: MasonryItem>(&self, items: &[T]) -> MasonryColumns {
        let mut columns = vec![MasonryColumn::default(); self.column_count];
        for (index, item) in items.iter().enumerate() {
            let height = self.item_height(item.aspect_ratio());
            let shortest = columns
                .iter()
                .enumerate()
                .fold(0, |best, (candidate, column)| {
                    if column.height < columns[best].height {
                        candidate
                    } else {
                        best
                    }
                });
            let column = &mut columns[shortest];
            column.items.push(index);
            column.height += height + self.spacing;
        }
        MasonryColumns { columns }
    }
}
