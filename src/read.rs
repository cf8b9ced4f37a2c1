use crate::compression;
use crate::error::Error;
use crate::fetch::fetch;
use crate::frame::{CloseStatus, OpCode, FIN_BIT, MASK_BIT, MAX_CONTROL_PAYLOAD, RSV1_BIT};
use crate::mask::MaskingKey;
use crate::outbound::OutboundQueue;
use bytes::BytesMut;
use tokio::io::AsyncRead;

/// Resumable decoder for one connection's inbound frame stream.
///
/// The state machine consumes whatever the read loop managed to pull off
/// the socket and picks up exactly where it stopped on the next call: a
/// frame header may straddle two read buffers (the missing bytes are then
/// drawn directly from the source), and a payload may arrive across many.
pub struct ReadState {
    // True when the next byte to consume begins a new frame header.
    awaiting_header: bool,
    // True when the next data frame must be Text or Binary, false while the
    // continuations of a fragmented message are pending.
    first_fragment: bool,
    // Compression flag of the current message, carried from its first
    // fragment through the continuations.
    current_compressed: bool,
    // Payload bytes of the current frame not yet consumed.
    remaining: usize,
    mask: MaskingKey,
    // Compressed bytes of the in-flight message, accumulated across
    // fragments and inflated in one go once the final fragment is in.
    accum: BytesMut,
}

impl Default for ReadState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadState {
    pub fn new() -> Self {
        Self {
            awaiting_header: true,
            first_fragment: true,
            current_compressed: false,
            remaining: 0,
            mask: MaskingKey::default(),
            accum: BytesMut::new(),
        }
    }

    /// Decodes every frame available in `buf`, pushing application payload
    /// slices onto `payloads` in wire order and answering control frames on
    /// `out`. Header fields cut off by the end of `buf` are completed from
    /// `src`.
    ///
    /// A peer Close yields `Error::SessionClosed` once the reciprocal Close
    /// has been enqueued; payloads decoded earlier in the call are already
    /// in `payloads` at that point, and the caller delivers them upstream
    /// before tearing the session down. The same holds for every other
    /// error return.
    pub async fn decode<S: AsyncRead + Unpin>(
        &mut self,
        src: &mut S,
        buf: &[u8],
        payloads: &mut Vec<Vec<u8>>,
        out: &OutboundQueue,
    ) -> Result<(), Error> {
        let mut pos = 0usize;

        while pos < buf.len() {
            if self.awaiting_header {
                let first = fetch(src, buf, &mut pos, 1).await?[0];
                let second = fetch(src, buf, &mut pos, 1).await?[0];

                let frame_final = first & FIN_BIT != 0;
                let compressed = first & RSV1_BIT != 0;
                let masked = second & MASK_BIT != 0;
                let len7 = (second & 0x7f) as usize;

                // Frames from a client must always be masked.
                if !masked {
                    return fail(out, Error::MaskMissing);
                }

                let opcode = match OpCode::from(first & 0x0f) {
                    Ok(opcode) => opcode,
                    Err(err) => return fail(out, err),
                };

                if opcode.is_control() {
                    if len7 > MAX_CONTROL_PAYLOAD {
                        return fail(out, Error::ControlFrameTooBig);
                    }
                    if !frame_final {
                        return fail(out, Error::ControlFrameNotFinal);
                    }
                } else {
                    match opcode {
                        OpCode::Text | OpCode::Binary => {
                            if !self.first_fragment {
                                return fail(out, Error::MessageBeforeFinalFrame);
                            }
                            self.first_fragment = frame_final;
                            self.current_compressed = compressed;
                        }
                        OpCode::Continuation => {
                            // A continuation can neither start a message nor
                            // carry the compression bit of its own.
                            if self.first_fragment || compressed {
                                return fail(out, Error::InvalidContinuationFrame);
                            }
                            self.first_fragment = frame_final;
                        }
                        _ => unreachable!("control opcodes are handled above"),
                    }
                }

                let frame_len = match len7 {
                    126 => {
                        let be = fetch(src, buf, &mut pos, 2).await?;
                        u16::from_be_bytes([be[0], be[1]]) as usize
                    }
                    127 => {
                        let be = fetch(src, buf, &mut pos, 8).await?;
                        u64::from_be_bytes([
                            be[0], be[1], be[2], be[3], be[4], be[5], be[6], be[7],
                        ]) as usize
                    }
                    n => n,
                };

                let key = fetch(src, buf, &mut pos, 4).await?;
                self.mask.set([key[0], key[1], key[2], key[3]]);

                if opcode.is_control() {
                    // Control frames are small enough to consume in place,
                    // and they interleave transparently between the
                    // fragments of a data message: none of the
                    // fragmentation state above is touched.
                    let mut payload = fetch(src, buf, &mut pos, frame_len).await?.into_owned();
                    self.mask.apply(&mut payload);

                    match opcode {
                        OpCode::Ping => out.enqueue_control(OpCode::Pong, payload),
                        OpCode::Pong => {}
                        OpCode::Close => {
                            handle_close(out, &payload);
                            return Err(Error::SessionClosed);
                        }
                        _ => unreachable!(),
                    }
                    continue;
                }

                self.remaining = frame_len;
                self.awaiting_header = false;
            }

            // Consume as much of the current frame's payload as the buffer
            // holds. Zero-length frames complete right away.
            let take = self.remaining.min(buf.len() - pos);
            let mut chunk = buf[pos..pos + take].to_vec();
            pos += take;
            self.remaining -= take;
            self.mask.apply(&mut chunk);

            if self.current_compressed {
                // Compressed bytes are unmasked as they arrive but only
                // inflated once the final fragment is complete, nothing is
                // emitted before that.
                self.accum.extend_from_slice(&chunk);
            } else if !chunk.is_empty() {
                // The upstream parser tolerates partial reads, so plain
                // slices are emitted as soon as they are unmasked, even
                // mid-frame.
                payloads.push(chunk);
            }

            if self.remaining == 0 {
                self.awaiting_header = true;
                if self.first_fragment {
                    // Final fragment consumed, the message is complete.
                    if self.current_compressed {
                        let mut inflater = compression::acquire_decompressor();
                        let inflated = compression::decompress_message(&mut inflater, &self.accum);
                        compression::release_decompressor(inflater);
                        payloads.push(inflated?);
                    }
                    self.accum.clear();
                    self.current_compressed = false;
                }
            }
        }

        Ok(())
    }
}

// Answers a framing violation with Close(1002) carrying the error text, and
// hands the error back so the read loop tears the connection down.
fn fail(out: &OutboundQueue, err: Error) -> Result<(), Error> {
    out.enqueue_close(CloseStatus::ProtocolError.as_u16(), err.to_string().as_bytes());
    Err(err)
}

fn handle_close(out: &OutboundQueue, payload: &[u8]) {
    let mut status = CloseStatus::NoStatusReceived.as_u16();
    let mut body: &[u8] = &[];
    if payload.len() >= 2 {
        status = u16::from_be_bytes([payload[0], payload[1]]);
        body = &payload[2..];
        if std::str::from_utf8(body).is_err() {
            status = CloseStatus::InvalidPayload.as_u16();
            body = b"invalid utf8 body in close frame";
        }
    }
    out.enqueue_close(status, body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::client_frame;

    async fn decode_all(wire: &[u8]) -> (Vec<Vec<u8>>, Result<(), Error>, OutboundQueue) {
        let queue = OutboundQueue::new();
        let mut state = ReadState::new();
        let mut payloads = Vec::new();
        let mut src: &[u8] = &[];
        let res = state.decode(&mut src, wire, &mut payloads, &queue).await;
        (payloads, res, queue)
    }

    const KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    #[tokio::test]
    async fn test_single_binary_frame() {
        let wire = client_frame(true, false, OpCode::Binary, KEY, b"PUB foo 7\r\nfrom ws\r\n");
        let (payloads, res, _) = decode_all(&wire).await;
        res.unwrap();
        assert_eq!(payloads, vec![b"PUB foo 7\r\nfrom ws\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_boundary_payload_sizes() {
        for size in [0usize, 125, 126, 65535, 65536, 100000] {
            let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let wire = client_frame(true, false, OpCode::Binary, KEY, &payload);
            let (payloads, res, _) = decode_all(&wire).await;
            res.unwrap();
            let collected: Vec<u8> = payloads.concat();
            assert_eq!(collected, payload, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_fragmented_message_emits_each_part() {
        let mut wire = client_frame(false, false, OpCode::Binary, KEY, b"first");
        wire.extend(client_frame(false, false, OpCode::Continuation, KEY, b"second"));
        wire.extend(client_frame(true, false, OpCode::Continuation, KEY, b"third"));

        let (payloads, res, _) = decode_all(&wire).await;
        res.unwrap();
        assert_eq!(
            payloads,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_control_frame_between_fragments() {
        let mut wire = client_frame(false, false, OpCode::Binary, KEY, b"first");
        wire.extend(client_frame(true, false, OpCode::Pong, KEY, b""));
        wire.extend(client_frame(true, false, OpCode::Continuation, KEY, b"second"));

        let (payloads, res, queue) = decode_all(&wire).await;
        res.unwrap();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
        // The Pong is absorbed silently.
        assert!(queue.collapse().is_none());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        for payload in [b"".as_slice(), b"ping body".as_slice()] {
            let wire = client_frame(true, false, OpCode::Ping, KEY, payload);
            let (payloads, res, queue) = decode_all(&wire).await;
            res.unwrap();
            assert!(payloads.is_empty());

            let reply = queue.collapse().unwrap();
            assert_eq!(reply[0], FIN_BIT | OpCode::Pong.as_u8());
            assert_eq!(reply[1] as usize, payload.len());
            assert_eq!(&reply[2..], payload);
        }
    }

    #[tokio::test]
    async fn test_close_with_body() {
        let mut body = 1000u16.to_be_bytes().to_vec();
        body.extend_from_slice(b"bye");
        let mut wire = client_frame(true, false, OpCode::Binary, KEY, b"last words");
        wire.extend(client_frame(true, false, OpCode::Close, KEY, &body));

        let (payloads, res, queue) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::SessionClosed)));
        // Payloads decoded before the Close are still delivered.
        assert_eq!(payloads, vec![b"last words".to_vec()]);

        let reply = queue.collapse().unwrap();
        assert_eq!(reply[0], FIN_BIT | OpCode::Close.as_u8());
        assert_eq!(&reply[2..4], &1000u16.to_be_bytes());
        assert_eq!(&reply[4..], b"bye");
    }

    #[tokio::test]
    async fn test_close_with_empty_body_defaults_to_1005() {
        let wire = client_frame(true, false, OpCode::Close, KEY, b"");
        let (_, res, queue) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::SessionClosed)));

        let reply = queue.collapse().unwrap();
        assert_eq!(&reply[2..4], &1005u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_close_with_invalid_utf8_body() {
        let mut body = 1000u16.to_be_bytes().to_vec();
        body.extend_from_slice(&[0xff, 0xfe, 0xfd]);
        let wire = client_frame(true, false, OpCode::Close, KEY, &body);

        let (_, res, queue) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::SessionClosed)));

        let reply = queue.collapse().unwrap();
        assert_eq!(&reply[2..4], &1007u16.to_be_bytes());
        assert_eq!(&reply[4..], b"invalid utf8 body in close frame");
    }

    #[tokio::test]
    async fn test_oversized_control_frame() {
        let wire = client_frame(true, false, OpCode::Ping, KEY, &[0u8; 200]);
        let (_, res, queue) = decode_all(&wire).await;
        let err = res.unwrap_err();
        assert!(matches!(err, Error::ControlFrameTooBig));

        let reply = queue.collapse().unwrap();
        assert_eq!(&reply[2..4], &1002u16.to_be_bytes());
        assert_eq!(
            &reply[4..],
            b"control frame length bigger than maximum allowed"
        );
    }

    #[tokio::test]
    async fn test_mask_bit_missing() {
        let mut wire = client_frame(true, false, OpCode::Binary, KEY, b"x");
        wire[1] &= !MASK_BIT;
        let (_, res, queue) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::MaskMissing)));

        let reply = queue.collapse().unwrap();
        assert_eq!(&reply[2..4], &1002u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_fragmented_control_frame_rejected() {
        let wire = client_frame(false, false, OpCode::Ping, KEY, b"");
        let (_, res, _) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::ControlFrameNotFinal)));
    }

    #[tokio::test]
    async fn test_data_frame_during_fragmented_message_rejected() {
        let mut wire = client_frame(false, false, OpCode::Binary, KEY, b"first");
        wire.extend(client_frame(true, false, OpCode::Binary, KEY, b"second"));
        let (payloads, res, _) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::MessageBeforeFinalFrame)));
        assert_eq!(payloads, vec![b"first".to_vec()]);
    }

    #[tokio::test]
    async fn test_unexpected_continuation_rejected() {
        let wire = client_frame(true, false, OpCode::Continuation, KEY, b"stray");
        let (_, res, _) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::InvalidContinuationFrame)));
    }

    #[tokio::test]
    async fn test_compressed_continuation_rejected() {
        let mut wire = client_frame(false, false, OpCode::Binary, KEY, b"first");
        wire.extend(client_frame(true, true, OpCode::Continuation, KEY, b"second"));
        let (_, res, _) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::InvalidContinuationFrame)));
    }

    #[tokio::test]
    async fn test_unknown_opcode_rejected() {
        let mut wire = client_frame(true, false, OpCode::Binary, KEY, b"x");
        wire[0] = (wire[0] & 0xf0) | 0x3;
        let (_, res, _) = decode_all(&wire).await;
        assert!(matches!(res, Err(Error::UnknownOpcode(0x3))));
    }

    #[tokio::test]
    async fn test_payload_split_across_reads() {
        let wire = client_frame(true, false, OpCode::Binary, KEY, b"split across reads");

        let queue = OutboundQueue::new();
        let mut state = ReadState::new();
        let mut payloads = Vec::new();
        let mut src: &[u8] = &[];

        // Feed the frame in two arbitrary pieces; the mask position must
        // carry over between the calls.
        let cut = 11;
        state
            .decode(&mut src, &wire[..cut], &mut payloads, &queue)
            .await
            .unwrap();
        state
            .decode(&mut src, &wire[cut..], &mut payloads, &queue)
            .await
            .unwrap();

        assert_eq!(payloads.concat(), b"split across reads");
    }
}
