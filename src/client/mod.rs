// 上传接口客户端
//
// HttpUploadClient 同时实现会话、上传目标签发和分片传输三个协作接口

mod http;

pub use http::{HttpUploadClient, STREAM_SLICE_SIZE};
