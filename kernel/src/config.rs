/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Compile-time configuration.
//!
//! Tunables (the scheduler's tick period) and debug toggles (`config_debug_malloc_magic`,
//! `config_debug_malloc_check`, `config_debug_qemu`) live in `default.build-config.toml`,
//! optionally overridden by a sibling `build-config.toml`. `build/main.rs` turns the debug section
//! into `--cfg` flags and every other value into a generated constant file under `OUT_DIR`. This
//! module only exposes the macro that pulls such a file into Rust source.

/// Expands to the value of a configuration constant generated by the build script, from
/// `$OUT_DIR/<name>.rs`.
#[macro_export]
macro_rules! build_cfg {
	($name:ident) => {
		include!(concat!(env!("OUT_DIR"), "/", stringify!($name), ".rs"))
	};
}
