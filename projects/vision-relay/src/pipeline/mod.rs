// Live analysis pipeline: frame buffer, detection, per-session workers

pub mod analysis;
pub mod detection;
pub mod frame_buffer;
pub mod orchestrator;
pub mod processor;
pub mod reader;
pub mod types;

#[cfg(test)]
pub mod test_support;
