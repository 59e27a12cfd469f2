// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::prelude::*;
use std::path::Path;

fn strip_comments(input: &str) -> String {
    let mut body = String::new();
    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with("#") {
            body += "\n";
        } else {
            body = body + line + "\n";
        }
    }
    body
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut f = fs::OpenOptions::new().read(true).open(path)?;
        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        Ok(serde_json::from_str::<Self>(&strip_comments(&buf))?)
    }
}
