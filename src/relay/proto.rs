//! `model.ImageService` wire types and streaming client

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Image {
    #[prost(bytes = "vec", tag = "1")]
    pub image_data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamImageRequest {
    #[prost(message, optional, tag = "1")]
    pub image: Option<Image>,
    #[prost(bool, tag = "2")]
    pub is_key_frame: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageResponse {
    #[prost(message, optional, tag = "1")]
    pub image: Option<Image>,
}

const STREAM_IMAGE_PATH: &str = "/model.ImageService/StreamImage";

/// Client for the bidirectional `StreamImage` call
#[derive(Debug, Clone)]
pub struct ImageServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ImageServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Set the largest response message accepted, in bytes
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_decoding_message_size(limit);
        self
    }

    /// Set the largest request message sent, in bytes
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_encoding_message_size(limit);
        self
    }

    pub async fn stream_image(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = StreamImageRequest>,
    ) -> Result<tonic::Response<tonic::Streaming<ImageResponse>>, tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {}", e)))?;
        let codec = tonic_prost::ProstCodec::default();
        let path = PathAndQuery::from_static(STREAM_IMAGE_PATH);
        self.inner
            .streaming(request.into_streaming_request(), path, codec)
            .await
    }
}
