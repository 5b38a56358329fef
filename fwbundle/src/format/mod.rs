// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod bl2;
pub mod gbb;
pub mod padding;
pub mod textbase;
