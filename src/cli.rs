// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Command-line surface, matching §6 exactly: `-c` (config path) and `-i`
//! (instance index) are mandatory, `-k` (cluster index) defaults to 0, and
//! `-h`/`-v` both exit 0 without starting the runtime. `clap`'s derive API
//! gives us `-h`/`--help` for free; `-v`/`--version` is wired up explicitly
//! since clap's own default version flag is `-V`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "evrtd", about = "Two-thread connector runtime", version = env!("CARGO_PKG_VERSION"), disable_version_flag = true)]
pub struct Args {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long = "config", value_name = "URI")]
    pub config: PathBuf,

    /// Instance index, distinguishing this process from siblings sharing a
    /// cluster index (used to derive the pid file and inbox socket paths).
    #[arg(short = 'i', long = "instance")]
    pub instance: u32,

    /// Cluster index; defaults to 0 for a single-cluster deployment.
    #[arg(short = 'k', long = "cluster", default_value_t = 0)]
    pub cluster: u32,

    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mandatory_flags() {
        let args = Args::parse_from(["evrtd", "-c", "/etc/evrt.json", "-i", "3"]);
        assert_eq!(args.config, PathBuf::from("/etc/evrt.json"));
        assert_eq!(args.instance, 3);
        assert_eq!(args.cluster, 0);
    }

    #[test]
    fn parses_optional_cluster_flag() {
        let args = Args::parse_from(["evrtd", "-c", "/etc/evrt.json", "-i", "3", "-k", "2"]);
        assert_eq!(args.cluster, 2);
    }

    #[test]
    fn missing_mandatory_flag_is_an_error() {
        let result = Args::try_parse_from(["evrtd", "-i", "3"]);
        assert!(result.is_err());
    }
}
