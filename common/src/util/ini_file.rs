//
//  Copyright 2023 Google, Inc.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at:
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! # IniFile class
//!
//! A versioned `key=value` store. Used for the daemon configuration file
//! and for the persisted Wi-Fi settings.

use anyhow::{anyhow, Context};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Reserved key carrying the format version of the file.
pub const VERSION_KEY: &str = "version";

pub struct IniFile {
    /// The data stored in the ini file, ordered so writes are stable.
    data: BTreeMap<String, String>,
    /// The path to the ini file.
    filepath: PathBuf,
}

impl IniFile {
    /// Creates a new empty IniFile backed by `filepath`.
    pub fn new(filepath: PathBuf) -> IniFile {
        IniFile { data: BTreeMap::new(), filepath }
    }

    /// Creates an IniFile from raw bytes.
    ///
    /// Blank lines, lines without `=` and lines starting with `#` are
    /// skipped. Keys and values are trimmed.
    pub fn from_bytes(filepath: PathBuf, bytes: &[u8]) -> anyhow::Result<IniFile> {
        let mut inifile = IniFile::new(filepath);
        inifile.parse(bytes)?;
        Ok(inifile)
    }

    fn parse(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.data.clear();
        let contents = std::str::from_utf8(bytes).context("ini file is not valid utf-8")?;
        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                self.data.insert(key.to_owned(), value.trim().to_owned());
            }
        }
        Ok(())
    }

    /// Serializes the store, version line first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        if let Some(version) = self.data.get(VERSION_KEY) {
            out.push_str(&format!("{}={}\n", VERSION_KEY, version));
        }
        for (key, value) in self.data.iter().filter(|(k, _)| k.as_str() != VERSION_KEY) {
            out.push_str(&format!("{}={}\n", key, value));
        }
        out.into_bytes()
    }

    /// Reads data into IniFile from the backing file, overwriting any
    /// existing data.
    pub fn read(&mut self) -> anyhow::Result<()> {
        let bytes = fs::read(&self.filepath)
            .with_context(|| format!("failed to read {}", self.filepath.display()))?;
        self.parse(&bytes)
    }

    /// Writes the current IniFile to the backing file.
    pub fn write(&self) -> anyhow::Result<()> {
        fs::write(&self.filepath, self.to_bytes())
            .with_context(|| format!("failed to write {}", self.filepath.display()))
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    /// Checks if a certain key exists in the file.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Gets value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|v| v.as_str())
    }

    /// Inserts a key-value pair.
    pub fn insert(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_owned(), value.to_owned());
    }

    /// All keys except the version key.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|k| k.as_str()).filter(|k| *k != VERSION_KEY)
    }

    /// Parses a `true`/`false` (or `1`/`0`) value.
    pub fn get_bool(&self, key: &str) -> anyhow::Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true") | Some("1") => Ok(Some(true)),
            Some("false") | Some("0") => Ok(Some(false)),
            Some(other) => Err(anyhow!("invalid boolean for {key}: {other}")),
        }
    }

    pub fn get_u64(&self, key: &str) -> anyhow::Result<Option<u64>> {
        self.get(key)
            .map(|v| v.parse::<u64>().map_err(|e| anyhow!("invalid number for {key}: {e}")))
            .transpose()
    }

    /// The format version, `None` when the file carries no version line.
    pub fn version(&self) -> anyhow::Result<Option<u32>> {
        self.get(VERSION_KEY)
            .map(|v| v.parse::<u32>().map_err(|e| anyhow!("invalid version: {e}")))
            .transpose()
    }

    pub fn set_version(&mut self, version: u32) {
        self.insert(VERSION_KEY, &version.to_string());
    }
}
