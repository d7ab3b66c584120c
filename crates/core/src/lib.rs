//! Cadenza core: non-destructive audio editing
//!
//! The domain layer owns the immutable original recording, the effects engine
//! that re-derives the audible buffer from it, the undo/redo history, the
//! preview state machine and the single-flight editor that serialises
//! mutating work. Platform audio and file formats live in `cadenza-infra`.

pub mod domain;
