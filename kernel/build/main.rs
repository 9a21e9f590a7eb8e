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

//! The build script reads the compile-time configuration file and turns it into `--cfg` flags and
//! generated constants.

pub mod config;

use crate::config::Config;
use std::{env, process::exit};

fn main() {
	let profile = env::var("PROFILE").unwrap();
	let debug = profile == "debug";
	let config = Config::read().unwrap_or_else(|e| {
		eprintln!("failed to read build configuration file: {e}");
		exit(1);
	});
	config.set_cfg(debug);
	// The kernel is linked with no loader: keep page-sized alignments only.
	println!("cargo:rustc-link-arg=-zmax-page-size=0x1000");
}
