use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Axis-aligned bounding box in pixel space (top-left origin).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn centre(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Finite coordinates with a strictly positive extent.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite()) && self.w > 0.0 && self.h > 0.0
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let ix = (self.x2().min(other.x2()) - self.x.max(other.x)).max(0.0);
        let iy = (self.y2().min(other.y2()) - self.y.max(other.y)).max(0.0);
        ix * iy
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Fraction of `inner` that lies inside `self`.
    pub fn containment_of(&self, inner: &BBox) -> f32 {
        let area = inner.area();
        if area <= 0.0 {
            return 0.0;
        }
        self.intersection_area(inner) / area
    }

    pub fn centre_distance(&self, other: &BBox) -> f32 {
        let (ax, ay) = self.centre();
        let (bx, by) = other.centre();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

/// Closed set of PPE item kinds checked for compliance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PpeItem {
    Helmet,
    Vest,
    Gloves,
    Boots,
    Goggles,
}

impl PpeItem {
    pub const ALL: [PpeItem; 5] = [
        PpeItem::Helmet,
        PpeItem::Vest,
        PpeItem::Gloves,
        PpeItem::Boots,
        PpeItem::Goggles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PpeItem::Helmet => "helmet",
            PpeItem::Vest => "vest",
            PpeItem::Gloves => "gloves",
            PpeItem::Boots => "boots",
            PpeItem::Goggles => "goggles",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PpeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PpeItem {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "helmet" => Ok(PpeItem::Helmet),
            "vest" => Ok(PpeItem::Vest),
            "gloves" | "glove" => Ok(PpeItem::Gloves),
            "boots" | "boot" => Ok(PpeItem::Boots),
            "goggles" | "goggle" => Ok(PpeItem::Goggles),
            other => Err(anyhow!("unknown PPE item '{}'", other)),
        }
    }
}

/// What a detector label means to the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectionClass {
    Person,
    /// PPE item seen on someone.
    Item(PpeItem),
    /// Detector affirmed the item is missing (`no_helmet`, ...).
    MissingItem(PpeItem),
    /// Anything else, including the catch-all `none` class.
    Other,
}

impl DetectionClass {
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label == "person" {
            return DetectionClass::Person;
        }
        if let Some(rest) = label.strip_prefix("no_").or_else(|| label.strip_prefix("no-")) {
            return match rest.parse::<PpeItem>() {
                Ok(item) => DetectionClass::MissingItem(item),
                Err(_) => DetectionClass::Other,
            };
        }
        match label.parse::<PpeItem>() {
            Ok(item) => DetectionClass::Item(item),
            Err(_) => DetectionClass::Other,
        }
    }
}

/// One detector output for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class: DetectionClass,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class: DetectionClass, confidence: f32, bbox: BBox) -> Self {
        Self {
            class,
            confidence,
            bbox,
        }
    }

    pub fn from_label(label: &str, confidence: f32, bbox: BBox) -> Self {
        Self::new(DetectionClass::from_label(label), confidence, bbox)
    }

    pub fn person(confidence: f32, bbox: BBox) -> Self {
        Self::new(DetectionClass::Person, confidence, bbox)
    }

    pub fn item(item: PpeItem, confidence: f32, bbox: BBox) -> Self {
        Self::new(DetectionClass::Item(item), confidence, bbox)
    }

    /// Confidence in [0, 1] and a usable box.
    pub fn is_well_formed(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence) && self.bbox.is_valid()
    }
}

/// Rectangular region of interest in pixel space, corner form.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Roi {
    pub fn validate(&self) -> Result<()> {
        let finite = [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.x2 <= self.x1 || self.y2 <= self.y1 {
            return Err(anyhow!("roi must have x2 > x1 and y2 > y1"));
        }
        Ok(())
    }

    /// True when the box centre lies inside the region.
    pub fn admits(&self, bbox: &BBox) -> bool {
        let (cx, cy) = bbox.centre();
        cx >= self.x1 && cx <= self.x2 && cy >= self.y1 && cy <= self.y2
    }
}
