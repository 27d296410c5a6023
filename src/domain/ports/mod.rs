mod animated_decoder_port;
mod network_port;
mod progressive_decoder_port;

pub use animated_decoder_port::{AnimatedCoderPort, AnimatedDecoderPort};
pub use network_port::{NetworkPort, ResponseDisposition, TransferDelegate, TransferHandle};
pub use progressive_decoder_port::ProgressiveDecoderPort;
