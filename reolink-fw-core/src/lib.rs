//! Core parser/extractor for the Reolink family of IP-camera and NVR
//! firmware PAK containers.
//!
//! The crate is organised bottom-up, mirroring the layering a firmware
//! image is actually built from: a random-access [`byteio`] window over
//! whatever byte source the caller hands in, a [`compress`] kit the
//! payload decoders share, fixed binary [`headers`], the [`pak`] container
//! itself, then the three read-only file-system readers ([`squashfs`],
//! [`cramfs`], [`ubifs`], sitting on top of [`ubi`]) unified behind [`fs`].
//! [`firmware`] is the façade that binds all of it into one report or one
//! on-disk extraction; [`archive`] handles the ZIP-of-PAKs wrapping some
//! firmware downloads ship in.

pub mod archive;
pub mod byteio;
pub mod compress;
pub mod cramfs;
pub mod error;
pub mod firmware;
pub mod fs;
pub mod headers;
pub mod pak;
pub mod squashfs;
pub mod tmpfile;
pub mod ubi;
pub mod ubifs;
pub mod util;

pub use error::{FwError, Result};
pub use firmware::{Firmware, Report};
