//! Camera feed collaborator for visual prompts.

use crate::error::Result;
use crate::model::ImageFrame;
use async_trait::async_trait;

/// A live camera the UI may attach.
#[async_trait]
pub trait VisualFeed: Send + Sync {
    /// Whether the camera is enabled and producing frames.
    fn is_ready(&self) -> bool;

    /// Grab the current frame.
    async fn capture_frame(&self) -> Result<ImageFrame>;
}
