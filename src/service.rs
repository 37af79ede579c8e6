use std::io::{Read, Write};

use log::{debug, error, info, warn};

use crate::channel::FramedChannel;
use crate::content_filter::{ContentFilter, InferenceSession};
use crate::protocol::{self, ImageResult, Inbound, ProcessImageRequest};

/// Outcome of handling one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Ready for the next message.
    Continue,
    /// The input closed cleanly.
    Terminated,
}

/// Sequential receive, classify, respond loop. One request is fully answered
/// before the next one is read, so responses keep request order.
pub struct Service<R, W, S> {
    channel: FramedChannel<R, W>,
    filter: ContentFilter<S>,
}

impl<R: Read, W: Write, S: InferenceSession> Service<R, W, S> {
    pub fn new(channel: FramedChannel<R, W>, filter: ContentFilter<S>) -> Self {
        Self { channel, filter }
    }

    /// Runs until the input stream ends.
    pub fn run(&mut self) {
        while self.step() == Step::Continue {}
    }

    pub fn step(&mut self) -> Step {
        let frame = match self.channel.receive() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Input closed. Exiting.");
                return Step::Terminated;
            }
            Err(err) => {
                error!("Error reading message: {err}");
                return Step::Continue;
            }
        };

        match protocol::decode(&frame) {
            Ok(Inbound::ProcessImage(request)) => {
                let result = self.process(request);
                self.respond(&result);
            }
            Ok(Inbound::Unrecognized(kind)) => {
                debug!("Ignoring message of type {kind}");
            }
            Err(err) => {
                error!("Dropping message: {err}");
            }
        }
        Step::Continue
    }

    /// Classifies one image. Any failure is answered with `should_hide: false`.
    fn process(&mut self, request: ProcessImageRequest) -> ImageResult {
        info!("Processing image: {}", request.image_id);
        let should_hide = match self.filter.should_hide(&request.image_data) {
            Ok(should_hide) => should_hide,
            Err(err) => {
                warn!(
                    "Error processing image {}: {err}; failing open",
                    request.image_id
                );
                false
            }
        };
        info!(
            "Decision for {}: shouldHide = {}",
            request.image_id, should_hide
        );
        ImageResult {
            image_id: request.image_id,
            should_hide,
        }
    }

    fn respond(&mut self, result: &ImageResult) {
        let bytes = match protocol::encode_result(result) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Error encoding response for {}: {err}", result.image_id);
                return;
            }
        };
        if let Err(err) = self.channel.send(&bytes) {
            error!("Error sending response for {}: {err}", result.image_id);
        }
    }

    pub fn into_filter(self) -> ContentFilter<S> {
        self.filter
    }

    #[cfg(test)]
    fn into_parts(self) -> (FramedChannel<R, W>, ContentFilter<S>) {
        (self.channel, self.filter)
    }
}
