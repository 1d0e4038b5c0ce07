#![allow(dead_code)]

pub mod fake;

#[cfg(windows)]
pub mod dx12;

pub fn setup_tracing() {
    hudscript::util::setup_tracing(None);
}
