//! # chat-export-md
//!
//! Converts AI chat export bundles from ChatGPT, Claude and Gemini into Markdown
//! files with YAML frontmatter and local image attachments.
//!
//! ## What it does
//!
//! Each provider ships conversations in its own shape: ChatGPT as a branching
//! message tree, Claude as flat message arrays plus memories and projects,
//! Gemini as saved chat pages (`.webarchive` or `.html`). Every conversation is
//! reduced to one linear message sequence, its images are copied, decoded or
//! downloaded into an `attachments/` folder, and the result is written as a
//! standalone Markdown file.
//!
//! Exports change shape without notice, so every bundle is first compared
//! against a known schema fingerprint. Drift is reported as warnings and never
//! stops a conversion.
//!
//! ## Layout
//!
//! ```text
//! providers/<provider>/<label>/          input bundle
//! obsidian_export/<provider>/<label>/
//!     markdown/<stem>.md                 one file per conversation
//!     attachments/<stem>_img01.png       images referenced by it
//! ```
//!
//! ## Usage
//!
//! ```sh
//! # Convert everything under ./providers that has not been converted yet
//! chat-export-md
//!
//! # Only check a bundle against the known export shape
//! chat-export-md ~/exports --only chatgpt/2025-06 --check
//! ```
//!
//! Preferences can be persisted in `~/.config/chat-export-md/config.toml`.

pub mod assets;
pub mod fetch;
pub mod fingerprint;
pub mod importer;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod renderer;
pub mod source;
pub mod utils;
