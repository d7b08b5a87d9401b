pub mod error;
pub mod request;
pub mod response;
pub mod stream;

pub use error::{ErrorResponse, OpenAIError};
pub use request::{
    GeneralRequest, ImageUrl, MediaContent, Message, MessageContent, StreamOptions,
};
pub use response::{
    ChatCompletionObjectType, PromptTokensDetails, ResponseMessage, TextResponse,
    TextResponseChoice, Usage,
};
pub use stream::{ChatCompletionChunk, ChatCompletionChunkObjectType, ChunkChoice, ChunkDelta};
