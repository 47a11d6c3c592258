#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

extern crate alloc;

#[macro_use]
pub mod util;
pub(crate) mod loom;
pub(crate) mod wait;

pub mod event;
pub mod mutex;
pub mod policy;
pub mod scheduler;
pub mod task;
pub mod when;

#[doc(inline)]
pub use self::event::AsyncEvent;
#[doc(inline)]
pub use self::mutex::AsyncMutex;
#[doc(inline)]
pub use self::policy::{DefaultPolicy, Policy};
#[doc(inline)]
pub use self::scheduler::{resume_background, resume_on, Schedule};
#[doc(inline)]
pub use self::task::Task;
#[doc(inline)]
pub use self::when::{when_all, when_any};
