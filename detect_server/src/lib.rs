use bytes::Bytes;

pub mod data_socket;
pub mod detector;
pub mod draw;
pub mod endpoints;
pub mod error;
pub mod live;
pub mod meter;
pub mod model;
pub mod nn;
pub mod orchestrator;
pub mod pubsub;
pub mod registry;
#[cfg(feature = "camera")]
pub mod sensors;
pub mod session;
pub mod sources;

#[cfg(test)]
pub(crate) mod testing;

/// Wrap a JPEG image as one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_jpeg_stream_item_framing() {
        let item = as_jpeg_stream_item(&[0xff, 0xd8]);

        assert!(item.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(item.ends_with(b"\xff\xd8\r\n\r\n"));
    }
}
