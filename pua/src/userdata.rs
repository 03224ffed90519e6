use chrono::{DateTime, Utc};
use mlua::{Lua, MetaMethod, UserData, UserDataMethods, Value as LuaValue};
use model::records::{Record, RecordItems};
use rust_decimal::Decimal;
use uuid::Uuid;
use value::Value;

#[derive(Clone)]
pub struct LuaRecord(pub Record);

#[derive(Clone)]
pub struct LuaRow(pub RecordItems);

#[derive(Clone, Copy)]
pub struct LuaUuid(pub Uuid);

#[derive(Clone, Copy)]
pub struct LuaTime(pub DateTime<Utc>);

#[derive(Clone, Copy)]
pub struct LuaDecimal(pub Decimal);

pub fn lua_value<'a>(lua: &'a Lua, v: &Value) -> mlua::Result<LuaValue<'a>> {
    use mlua::LuaSerdeExt;
    let out = match v {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Integer(n) => LuaValue::Integer(i64::from(*n)),
        Value::BigInt(n) => LuaValue::Integer(*n),
        Value::Float(n) => LuaValue::Number(f64::from(*n)),
        Value::Double(n) => LuaValue::Number(*n),
        Value::Numeric(d) => LuaValue::UserData(lua.create_userdata(LuaDecimal(*d))?),
        Value::Text(s) => LuaValue::String(lua.create_string(s)?),
        Value::Binary(b) => LuaValue::String(lua.create_string(b)?),
        Value::Date(_) | Value::Time(_) => {
            let encoded = v.to_serde_json_value();
            LuaValue::String(lua.create_string(encoded.as_str().unwrap_or(""))?)
        }
        Value::Timestamp(ts) => LuaValue::UserData(lua.create_userdata(LuaTime(ts.and_utc()))?),
        Value::TimestampWithTimeZone(ts) => {
            LuaValue::UserData(lua.create_userdata(LuaTime(*ts))?)
        }
        Value::Uuid(u) => LuaValue::UserData(lua.create_userdata(LuaUuid(*u))?),
        Value::Json(j) => lua.to_value(j)?,
        Value::Geometry(s) | Value::Geography(s) => LuaValue::String(lua.create_string(s)?),
        Value::Array(_) => lua.to_value(&v.to_serde_json_value())?,
    };
    Ok(out)
}

impl UserData for LuaRow {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            match this.0.get(&key) {
                Some(v) => lua_value(lua, v),
                None => Ok(LuaValue::Nil),
            }
        });
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.len()));
    }
}

impl UserData for LuaRecord {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            let out = match key.as_str() {
                "kind" => {
                    let kind = match &this.0 {
                        Record::Insert(_) => "insert",
                        Record::Update(_) => "update",
                        Record::Delete(_) => "delete",
                        Record::Relation(_) => "relation",
                    };
                    LuaValue::String(lua.create_string(kind)?)
                }
                "checkpoint_id" => LuaValue::Integer(this.0.checkpoint_id()),
                "commit_time" => {
                    LuaValue::UserData(lua.create_userdata(LuaTime(this.0.commit_time()))?)
                }
                "source" => match &this.0 {
                    Record::Insert(r) => LuaValue::String(lua.create_string(&r.source_table)?),
                    Record::Update(r) => LuaValue::String(lua.create_string(&r.source_table)?),
                    Record::Delete(r) => LuaValue::String(lua.create_string(&r.source_table)?),
                    Record::Relation(r) => {
                        LuaValue::String(lua.create_string(&r.relation.relation_name)?)
                    }
                },
                "destination" => match this.0.destination_table() {
                    Some(t) => LuaValue::String(lua.create_string(t)?),
                    None => LuaValue::Nil,
                },
                "row" => match this.0.items() {
                    Some(items) => {
                        LuaValue::UserData(lua.create_userdata(LuaRow(items.clone()))?)
                    }
                    None => LuaValue::Nil,
                },
                "old" => match this.0.match_items() {
                    Some(items) => {
                        LuaValue::UserData(lua.create_userdata(LuaRow(items.clone()))?)
                    }
                    None => LuaValue::Nil,
                },
                "unchanged_toast_columns" => {
                    let table = lua.create_table()?;
                    if let Some(cols) = this.0.unchanged_toast_columns() {
                        for (i, col) in cols.iter().enumerate() {
                            table.set(i + 1, col.as_str())?;
                        }
                    }
                    LuaValue::Table(table)
                }
                _ => LuaValue::Nil,
            };
            Ok(out)
        });
    }
}

impl UserData for LuaUuid {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: mlua::AnyUserData| {
            let other = other.borrow::<LuaUuid>()?;
            Ok(this.0 == other.0)
        });
    }
}

impl UserData for LuaTime {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |_, this, key: String| {
            let out = match key.as_str() {
                "unix" => Some(this.0.timestamp() as f64),
                "unix_ms" => Some(this.0.timestamp_millis() as f64),
                _ => None,
            };
            Ok(out)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_rfc3339()));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 == other.borrow::<LuaTime>()?.0)
        });
        methods.add_meta_method(MetaMethod::Lt, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 < other.borrow::<LuaTime>()?.0)
        });
        methods.add_meta_method(MetaMethod::Le, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 <= other.borrow::<LuaTime>()?.0)
        });
    }
}

fn decimal_binop<'lua, M: UserDataMethods<'lua, LuaDecimal>>(
    methods: &mut M,
    meta: MetaMethod,
    f: fn(Decimal, Decimal) -> Decimal,
) {
    methods.add_meta_method(meta, move |_, this, other: mlua::AnyUserData| {
        let other = other.borrow::<LuaDecimal>()?;
        Ok(LuaDecimal(f(this.0, other.0)))
    });
}

impl UserData for LuaDecimal {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 == other.borrow::<LuaDecimal>()?.0)
        });
        methods.add_meta_method(MetaMethod::Lt, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 < other.borrow::<LuaDecimal>()?.0)
        });
        methods.add_meta_method(MetaMethod::Le, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 <= other.borrow::<LuaDecimal>()?.0)
        });
        methods.add_meta_method(MetaMethod::Unm, |_, this, ()| Ok(LuaDecimal(-this.0)));
        decimal_binop(methods, MetaMethod::Add, |a, b| a + b);
        decimal_binop(methods, MetaMethod::Sub, |a, b| a - b);
        decimal_binop(methods, MetaMethod::Mul, |a, b| a * b);
        decimal_binop(methods, MetaMethod::Div, |a, b| a / b);
        decimal_binop(methods, MetaMethod::Mod, |a, b| a % b);
    }
}
