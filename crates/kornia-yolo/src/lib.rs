#![doc = include_str!(concat!("../", env!("CARGO_PKG_README")))]

#[doc(inline)]
pub use kornia_yolo_nn as nn;

#[doc(inline)]
pub use kornia_yolo_head as head;
