//! Pipeline stages for text-to-storyboard generation.
//!
//! Each submodule implements exactly one transformation step and is tested
//! on its own with stub providers.
//!
//! ## Data Flow
//!
//! ```text
//! segment ──▶ derive ──▶ runner ──▶ archive
//!  (text)     (prompts)  (images)    (zip)
//!                          │
//!                        gate (shared pacing state)
//! ```
//!
//! 1. [`segment`]: split the input into ordered scenes, structurally or
//!    via the text provider
//! 2. [`derive`]: attach one image prompt per scene in a single batched
//!    call; [`parse`] validates whatever the model sent back
//! 3. [`runner`]: generate one image per scene under the pacing gate
//!    ([`gate`]) with bounded retry and back-off
//! 4. [`archive`]: write successful images into a zip in scene order

pub mod archive;
pub mod derive;
pub mod gate;
pub mod parse;
pub mod runner;
pub mod segment;
