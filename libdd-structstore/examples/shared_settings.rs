// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Publishes a settings store under a named shared segment and reads it
//! back through a second mapping, as a sibling process would.

use libdd_structstore::{List, OpenOptions, Result, StructStoreShared};

fn main() -> Result<()> {
    let name = format!("/shsettings-{}", std::process::id());

    let mut publisher = OpenOptions::new().bufsize(16 * 1024).open(&name)?;
    {
        let mut guard = publisher.store_mut()?.lock_write();
        guard.set("num", 5)?;
        guard.set("value", 3.14)?;
        guard.set("flag", true)?;
        guard.set("str", "foo")?;
        let sub = guard.substore("subsettings")?;
        sub.set("subnum", 42)?;
        sub.set("substr", "bar")?;
        let list = guard.get_or_create::<List>("list")?;
        list.push_back_value(5)?;
        list.push_back_value(42)?;
        guard.unlock();
    }

    // a second mapping of the same segment, at its own base address
    let attached = StructStoreShared::open(&name)?;
    {
        let guard = attached.store()?.lock_read()?;
        println!("text: {}", &*guard);
        println!("yaml:\n{}", guard.to_yaml_string()?);
        guard.unlock();
    }

    drop(attached);
    publisher.close()?;
    Ok(())
}
