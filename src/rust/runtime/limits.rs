// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Default size of a lightweight thread's stack, excluding its guard page.
pub const DEFAULT_STACK_BYTES: usize = 256 * 1024;

/// Smallest stack a lightweight thread may be configured with.
pub const MIN_STACK_BYTES: usize = 32 * 1024;

/// Largest number of workers (OS threads) a scheduler accepts.
pub const MAX_WORKERS: usize = 512;

/// Number of retired stacks each worker keeps around for reuse.
pub const STACK_FREELIST_DEPTH: usize = 32;

/// Default number of generations a generation counter tracks with dedicated wait queues.
pub const DEFAULT_GENERATIONS_INPLACE: usize = 4;

/// Largest number of localities an address can name.
pub const MAX_LOCALITIES: u32 = u16::MAX as u32 - 1;
