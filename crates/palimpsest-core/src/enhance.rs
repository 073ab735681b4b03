use async_trait::async_trait;

/// Outcome of the enhancement collaborator: the (possibly identical) image
/// and the names of the operations that were applied to it.
#[derive(Debug, Clone)]
pub struct EnhancedImage {
    pub image: Vec<u8>,
    pub applied: Vec<String>,
}

/// Capability seam for image enhancement. The restoration primitives
/// themselves (deskew, contrast equalization, denoising) live outside the
/// engine; the Scanner only consumes this interface.
#[async_trait]
pub trait ImageEnhancer: Send + Sync {
    async fn enhance(&self, image: &[u8]) -> anyhow::Result<EnhancedImage>;
}

/// Identity enhancer: returns the original bytes and reports no applied
/// operations. The engine default when no collaborator is wired in.
pub struct PassthroughEnhancer;

#[async_trait]
impl ImageEnhancer for PassthroughEnhancer {
    async fn enhance(&self, image: &[u8]) -> anyhow::Result<EnhancedImage> {
        Ok(EnhancedImage {
            image: image.to_vec(),
            applied: Vec::new(),
        })
    }
}
