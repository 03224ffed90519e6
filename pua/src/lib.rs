use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib, Value as LuaValue};
use rust_decimal::Decimal;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod pool;
pub mod transform;
mod userdata;

pub use pool::LuaPool;
pub use transform::{default_payload, RecordTransformer, TransformedEvent};
pub use userdata::{lua_value, LuaDecimal, LuaRecord, LuaRow, LuaTime, LuaUuid};

const HOOK_INSTRUCTION_GRANULARITY: u32 = 10_000;

/// Builds one sandboxed interpreter: safe stdlib subset, curated helper
/// modules, the user script loaded, and a cancellation hook installed.
/// Scripts reach the runtime only through the catalog loader, never from
/// disk.
pub fn new_lua_state(script: Option<&str>, token: CancellationToken) -> anyhow::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;

    register_modules(&lua)?;

    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_GRANULARITY),
        move |_lua, _debug| {
            if token.is_cancelled() {
                Err(mlua::Error::external("script interrupted"))
            } else {
                Ok(())
            }
        },
    );

    if let Some(script) = script {
        lua.load(script)
            .set_name("user_script")
            .exec()
            .map_err(|e| anyhow::anyhow!("error executing script: {e}"))?;
    }

    Ok(lua)
}

fn register_modules(lua: &Lua) -> anyhow::Result<()> {
    let globals = lua.globals();

    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|lua, v: LuaValue| {
            let encoded = serde_json::to_string(&v).map_err(mlua::Error::external)?;
            lua.create_string(&encoded)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, s: mlua::String| {
            let decoded: serde_json::Value =
                serde_json::from_slice(s.as_bytes()).map_err(mlua::Error::external)?;
            lua.to_value(&decoded)
        })?,
    )?;
    globals.set("json", json)?;

    let msgpack = lua.create_table()?;
    msgpack.set(
        "encode",
        lua.create_function(|lua, v: LuaValue| {
            let encoded = rmp_serde::to_vec_named(&v).map_err(mlua::Error::external)?;
            lua.create_string(&encoded)
        })?,
    )?;
    msgpack.set(
        "decode",
        lua.create_function(|lua, s: mlua::String| {
            let decoded: serde_json::Value =
                rmp_serde::from_slice(s.as_bytes()).map_err(mlua::Error::external)?;
            lua.to_value(&decoded)
        })?,
    )?;
    globals.set("msgpack", msgpack)?;

    let peerdb = lua.create_table()?;
    peerdb.set(
        "Now",
        lua.create_function(|_, ()| Ok(LuaTime(chrono::Utc::now())))?,
    )?;
    peerdb.set(
        "UUID",
        lua.create_function(|_, ()| Ok(LuaUuid(Uuid::new_v4())))?,
    )?;
    peerdb.set(
        "Decimal",
        lua.create_function(|_, s: String| {
            Decimal::from_str(&s)
                .map(LuaDecimal)
                .map_err(mlua::Error::external)
        })?,
    )?;
    peerdb.set(
        "RowColumns",
        lua.create_function(|lua, row: mlua::AnyUserData| {
            let row = row.borrow::<LuaRow>()?;
            let table = lua.create_table()?;
            for (i, name) in row.0.column_names().enumerate() {
                table.set(i + 1, name)?;
            }
            Ok(table)
        })?,
    )?;
    peerdb.set(
        "RowColumnKind",
        lua.create_function(|_, (row, name): (mlua::AnyUserData, String)| {
            let row = row.borrow::<LuaRow>()?;
            Ok(row.0.get(&name).map(|v| v.kind().to_string()))
        })?,
    )?;
    peerdb.set(
        "RowTable",
        lua.create_function(|lua, row: mlua::AnyUserData| {
            let row = row.borrow::<LuaRow>()?;
            let table = lua.create_table()?;
            for (name, v) in row.0.iter() {
                table.set(name, lua_value(lua, v)?)?;
            }
            Ok(table)
        })?,
    )?;
    globals.set("peerdb", peerdb)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_has_no_io_or_os() {
        let lua = new_lua_state(None, CancellationToken::new()).unwrap();
        let io: LuaValue = lua.globals().get("io").unwrap();
        let os: LuaValue = lua.globals().get("os").unwrap();
        assert!(matches!(io, LuaValue::Nil));
        assert!(matches!(os, LuaValue::Nil));
    }

    #[test]
    fn json_module_round_trips() {
        let lua = new_lua_state(
            Some("function probe() return json.encode(json.decode('{\"a\":1}')) end"),
            CancellationToken::new(),
        )
        .unwrap();
        let probe: mlua::Function = lua.globals().get("probe").unwrap();
        let out: String = probe.call(()).unwrap();
        assert_eq!(out, "{\"a\":1}");
    }

    #[test]
    fn decimal_arithmetic_works_in_scripts() {
        let lua = new_lua_state(
            Some(
                "function probe() \
                   return tostring(peerdb.Decimal('1.5') + peerdb.Decimal('2.25')) \
                 end",
            ),
            CancellationToken::new(),
        )
        .unwrap();
        let probe: mlua::Function = lua.globals().get("probe").unwrap();
        let out: String = probe.call(()).unwrap();
        assert_eq!(out, "3.75");
    }

    #[test]
    fn cancelled_token_interrupts_long_scripts() {
        let token = CancellationToken::new();
        let lua = new_lua_state(
            Some("function spin() while true do end end"),
            token.clone(),
        )
        .unwrap();
        token.cancel();
        let spin: mlua::Function = lua.globals().get("spin").unwrap();
        let err = spin.call::<_, ()>(()).unwrap_err();
        assert!(err.to_string().contains("interrupted"), "got: {err}");
    }

    #[test]
    fn bad_scripts_fail_at_load() {
        let err = new_lua_state(Some("this is not lua"), CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("error executing script"));
    }
}
