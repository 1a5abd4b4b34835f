//! Turns a request's multimodal input into engine-ready data.

pub mod error;
pub mod media;
pub mod transfer;

use std::{fmt, sync::Arc, time::Duration};

use image::DynamicImage;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};
use crate::io_struct::{MediaKind, MultimodalInput, TensorDtype, TransferHandle};
use media::{MediaConnector, MediaSource};
use transfer::{Descriptor, HandleLedger, RemoteMemoryConnector, TransferError};

/// How a remotely read embedding buffer is presented to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingLayout {
    /// Raw numeric array, used by video-class models.
    NumericArray,
    /// Embedding tensor paired with a spatial grid descriptor.
    EmbeddingTensor,
}

impl EmbeddingLayout {
    pub fn for_model(model: &str) -> Self {
        if model.to_ascii_lowercase().contains("video") {
            EmbeddingLayout::NumericArray
        } else {
            EmbeddingLayout::EmbeddingTensor
        }
    }

    pub fn expected_dtype(&self) -> TensorDtype {
        match self {
            EmbeddingLayout::NumericArray => TensorDtype::UInt8,
            EmbeddingLayout::EmbeddingTensor => TensorDtype::Float16,
        }
    }
}

/// A materialized tensor. Owned by whoever holds the payload.
#[derive(Clone, PartialEq)]
pub struct MultimodalTensor {
    pub shape: Vec<usize>,
    pub dtype: TensorDtype,
    pub data: Vec<u8>,
}

impl fmt::Debug for MultimodalTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultimodalTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Multimodal data keyed the way the engine expects it.
pub enum MultimodalPayload {
    Image(DynamicImage),
    ImageEmbeddings {
        image_embeds: MultimodalTensor,
        image_grid_thw: Option<Vec<[u32; 3]>>,
    },
    Video(ArrayD<u8>),
}

impl MultimodalPayload {
    pub fn field_names(&self) -> &'static [&'static str] {
        match self {
            MultimodalPayload::Image(_) => &["image"],
            MultimodalPayload::ImageEmbeddings { .. } => &["image_embeds", "image_grid_thw"],
            MultimodalPayload::Video(_) => &["video"],
        }
    }
}

impl fmt::Debug for MultimodalPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultimodalPayload::Image(image) => f
                .debug_struct("Image")
                .field("width", &image.width())
                .field("height", &image.height())
                .finish(),
            MultimodalPayload::ImageEmbeddings {
                image_embeds,
                image_grid_thw,
            } => f
                .debug_struct("ImageEmbeddings")
                .field("image_embeds", image_embeds)
                .field("image_grid_thw", image_grid_thw)
                .finish(),
            MultimodalPayload::Video(array) => f
                .debug_struct("Video")
                .field("shape", &array.shape())
                .finish(),
        }
    }
}

/// Default cap on one remotely read embedding buffer (1 GiB).
pub const DEFAULT_MAX_EMBEDDING_BYTES: usize = 1 << 30;

pub struct Materializer {
    layout: EmbeddingLayout,
    media: MediaConnector,
    connector: Arc<dyn RemoteMemoryConnector>,
    ledger: HandleLedger,
    transfer_timeout: Duration,
    max_embedding_bytes: usize,
}

impl Materializer {
    pub fn new(
        layout: EmbeddingLayout,
        media: MediaConnector,
        connector: Arc<dyn RemoteMemoryConnector>,
        handle_retention: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Materializer {
            layout,
            media,
            connector,
            ledger: HandleLedger::new(handle_retention),
            transfer_timeout,
            max_embedding_bytes: DEFAULT_MAX_EMBEDDING_BYTES,
        }
    }

    pub fn with_max_embedding_bytes(mut self, max_embedding_bytes: usize) -> Self {
        self.max_embedding_bytes = max_embedding_bytes;
        self
    }

    pub fn layout(&self) -> EmbeddingLayout {
        self.layout
    }

    pub async fn materialize(
        &self,
        input: &MultimodalInput,
    ) -> WorkerResult<Option<MultimodalPayload>> {
        match input {
            MultimodalInput::None => Ok(None),
            MultimodalInput::MediaReference { url, media_kind } => {
                self.load_media(url, *media_kind).await.map(Some)
            }
            MultimodalInput::RemoteEmbedding {
                handle,
                shape,
                dtype,
                image_grid_thw,
            } => self
                .read_embeddings(handle, shape, *dtype, image_grid_thw.clone())
                .await
                .map(Some),
        }
    }

    async fn load_media(&self, url: &str, media_kind: MediaKind) -> WorkerResult<MultimodalPayload> {
        if media_kind != MediaKind::Image {
            return Err(error::MediaConnectorError::UnsupportedKind(media_kind).into());
        }
        let source = MediaSource::from_reference(url)?;
        let image = self.media.fetch_image(source).await?;
        debug!("Loaded image {}x{}", image.width(), image.height());
        Ok(MultimodalPayload::Image(image))
    }

    async fn read_embeddings(
        &self,
        handle: &TransferHandle,
        shape: &[usize],
        dtype: TensorDtype,
        image_grid_thw: Option<Vec<[u32; 3]>>,
    ) -> WorkerResult<MultimodalPayload> {
        let expected = self.layout.expected_dtype();
        if dtype != expected {
            return Err(WorkerError::malformed(
                "multimodal_input.dtype",
                format!("{:?} layout expects {:?}, got {:?}", self.layout, expected, dtype),
            ));
        }

        match dtype.byte_len(shape) {
            Some(len) if len <= self.max_embedding_bytes => {}
            _ => {
                return Err(WorkerError::malformed(
                    "multimodal_input.shape",
                    format!(
                        "{:?} tensor of shape {:?} exceeds the {} byte embedding limit",
                        dtype, shape, self.max_embedding_bytes
                    ),
                ));
            }
        }

        self.ledger.claim(handle)?;

        let destination = Descriptor::zeroed(shape, dtype)?;
        let expected_len = destination.len();
        let read_op = self.connector.begin_read(handle, destination).await?;
        let descriptor = tokio::time::timeout(self.transfer_timeout, read_op.wait_for_completion())
            .await
            .map_err(|_| TransferError::Timeout(self.transfer_timeout))??;

        if descriptor.len() != expected_len || descriptor.shape() != shape {
            return Err(WorkerError::TransferAborted(format!(
                "read returned {} bytes with shape {:?}, expected {} bytes with shape {:?}",
                descriptor.len(),
                descriptor.shape(),
                expected_len,
                shape
            )));
        }
        debug!(
            "Remote read of {} complete ({} bytes)",
            handle.as_str(),
            expected_len
        );

        let (shape, dtype, data) = descriptor.into_parts();
        match self.layout {
            EmbeddingLayout::NumericArray => {
                let array = ArrayD::from_shape_vec(IxDyn(&shape), data)
                    .map_err(|e| WorkerError::TransferAborted(e.to_string()))?;
                Ok(MultimodalPayload::Video(array))
            }
            EmbeddingLayout::EmbeddingTensor => Ok(MultimodalPayload::ImageEmbeddings {
                image_embeds: MultimodalTensor { shape, dtype, data },
                image_grid_thw,
            }),
        }
    }
}
