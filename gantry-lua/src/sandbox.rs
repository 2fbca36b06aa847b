//! Lua sandbox creation
//!
//! Definitions are evaluated in a restricted interpreter: no I/O, no OS
//! access and no way to load external code. The `pipeline` helper module is
//! always injected since every definition starts with `pipeline.define`.

use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Table};

/// Create a restricted Lua sandbox
///
/// Only the table, string and math libraries are loaded. `require`, `dofile`
/// and `loadfile` are removed so a definition cannot reach outside its own
/// source.
///
/// # Example
/// ```no_run
/// use gantry_lua::sandbox::create_sandbox;
///
/// let lua = create_sandbox()?;
/// let stage: mlua::Table = lua
///     .load(r#"return pipeline.build { name = "compile", image = "rust:1" }"#)
///     .eval()?;
/// let kind: String = stage.get("kind")?;
/// assert_eq!(kind, "build");
/// # Ok::<(), mlua::Error>(())
/// ```
pub fn create_sandbox() -> LuaResult<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )?;

    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;

    register_pipeline_module(&lua)?;

    Ok(lua)
}

/// Register the `pipeline` helper module
///
/// `define` passes the definition table through; the stage helpers only tag
/// the table with its `kind` so the parser knows how to read it.
fn register_pipeline_module(lua: &Lua) -> LuaResult<()> {
    let pipeline = lua.create_table()?;

    let define_fn = lua.create_function(|_, definition: Table| Ok(definition))?;
    pipeline.set("define", define_fn)?;

    for kind in ["build", "deploy", "approval"] {
        let stage_fn = lua.create_function(move |_, stage: Table| {
            stage.set("kind", kind)?;
            Ok(stage)
        })?;
        pipeline.set(kind, stage_fn)?;
    }

    // pipeline.grant(actions, resources, identity?)
    let grant_fn = lua.create_function(
        |lua, (actions, resources, identity): (Table, Table, Option<String>)| {
            let grant = lua.create_table()?;
            grant.set("actions", actions)?;
            grant.set("resources", resources)?;
            if let Some(identity) = identity {
                grant.set("identity", identity)?;
            }
            Ok(grant)
        },
    )?;
    pipeline.set("grant", grant_fn)?;

    lua.globals().set("pipeline", pipeline)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_basic_lua() {
        let lua = create_sandbox().unwrap();

        let result: i32 = lua
            .load(
                r#"
                local t = {a = 1, b = 2}
                return t.a + t.b
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(result, 3);

        let result: String = lua.load(r#"return string.upper("edge")"#).eval().unwrap();
        assert_eq!(result, "EDGE");
    }

    #[test]
    fn test_sandbox_no_io() {
        let lua = create_sandbox().unwrap();

        let has_io: bool = lua.load(r#"return io ~= nil"#).eval().unwrap();
        assert!(!has_io);

        let has_os: bool = lua.load(r#"return os ~= nil"#).eval().unwrap();
        assert!(!has_os);
    }

    #[test]
    fn test_sandbox_no_require() {
        let lua = create_sandbox().unwrap();

        let result: LuaResult<()> = lua.load(r#"require("os")"#).exec();
        assert!(result.is_err());

        let result: LuaResult<()> = lua.load(r#"dofile("/etc/passwd")"#).exec();
        assert!(result.is_err());
    }

    #[test]
    fn test_stage_helpers_tag_kind() {
        let lua = create_sandbox().unwrap();

        let kinds: Vec<String> = lua
            .load(
                r#"
                return {
                    pipeline.build({ name = "a" }).kind,
                    pipeline.deploy({ name = "b" }).kind,
                    pipeline.approval({ name = "c" }).kind,
                }
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(kinds, vec!["build", "deploy", "approval"]);
    }

    #[test]
    fn test_grant_helper() {
        let lua = create_sandbox().unwrap();

        let identity: String = lua
            .load(
                r#"
                local g = pipeline.grant({ "registry:pull" }, { "registry/*" }, "ops")
                return g.identity
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(identity, "ops");
    }
}
