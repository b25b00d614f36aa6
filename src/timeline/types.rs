//! Payload kinds shipped with the crate
//!
//! - [`Matrix4`]: tracked tool pose, stored in a [`MatrixTl`]
//! - [`TrackingMessage`]: small device message, stored in a [`MessageTl`]
//! - [`Frame`]: video frame, stored in a [`FrameTl`]

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::timeline::Timeline;

/// Timeline of tool poses
pub type MatrixTl = Timeline<Matrix4>;

/// Timeline of device messages
pub type MessageTl = Timeline<TrackingMessage>;

/// Timeline of video frames
pub type FrameTl = Timeline<Frame>;

/// 4x4 homogeneous transformation matrix
///
/// - Upper-left 3x3: rotation
/// - Upper-right 3x1: translation
/// - Bottom row: `[0, 0, 0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix4 {
    /// Row-major elements
    pub matrix: [[f32; 4]; 4],
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Matrix4 {
    /// Identity transformation
    pub fn identity() -> Self {
        Matrix4 {
            matrix: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Pure translation
    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        Matrix4 {
            matrix: [
                [1.0, 0.0, 0.0, x],
                [0.0, 1.0, 0.0, y],
                [0.0, 0.0, 1.0, z],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Translation column
    pub fn position(&self) -> [f32; 3] {
        [self.matrix[0][3], self.matrix[1][3], self.matrix[2][3]]
    }

    /// `self * rhs`: apply `rhs` first, then `self`
    pub fn compose(&self, rhs: &Matrix4) -> Matrix4 {
        let mut out = [[0.0f32; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.matrix[i][k] * rhs.matrix[k][j]).sum();
            }
        }
        Matrix4 { matrix: out }
    }
}

/// Small discriminated message produced by tracking devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackingMessage {
    /// Device status change
    Status {
        /// Device-specific status code (0 is OK)
        code: u16,
        /// Human-readable description
        text: String,
    },
    /// Free-form text
    Text(String),
    /// Tool tip position in millimetres
    Position([f32; 3]),
    /// Opaque device payload
    Raw(Bytes),
}

impl TrackingMessage {
    /// Short name of the variant, used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            TrackingMessage::Status { .. } => "STATUS",
            TrackingMessage::Text(_) => "STRING",
            TrackingMessage::Position(_) => "POSITION",
            TrackingMessage::Raw(_) => "RAW",
        }
    }
}

/// Video frame with interleaved components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Components per pixel (1 for grayscale, 3 for RGB, 4 for RGBA)
    pub components: u8,
    /// Pixel bytes, row-major, one byte per component
    pub data: Bytes,
}

impl Frame {
    /// Create a frame; `data` is shared, not copied
    pub fn new(width: u32, height: u32, components: u8, data: impl Into<Bytes>) -> Self {
        Frame {
            width,
            height,
            components,
            data: data.into(),
        }
    }

    /// Byte length implied by the dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.components as usize
    }

    /// Whether `data` holds exactly one full frame
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}
