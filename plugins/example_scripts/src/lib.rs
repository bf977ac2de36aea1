use anyhow::{ensure, Result};
use kestrel_scripts::abi::{ArgsHandle, ObjectHandle};
use kestrel_scripts::{ManifestRegistry, Script, ScriptContext, ScriptObject, ScriptValue};

#[derive(Default)]
struct Player {
    ticks: i64,
    distance: f64,
}

impl Script for Player {
    fn name(&self) -> &str {
        "game.Player"
    }

    fn load(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        ensure!(ctx.tag() == "player", "player script loaded under '{}'", ctx.tag());
        Ok(())
    }

    fn update(&mut self, _ctx: &mut ScriptContext<'_>, dt: f64) -> Result<()> {
        self.ticks += 1;
        self.distance += 4.0 * dt;
        Ok(())
    }

    fn invoke(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        method: &str,
        _args: &[ScriptValue],
    ) -> Option<Result<ScriptValue>> {
        match method {
            "ticks" => Some(Ok(ScriptValue::Int(self.ticks))),
            "distance" => Some(Ok(ScriptValue::Float(self.distance))),
            _ => None,
        }
    }
}

#[derive(Default)]
struct FollowCamera {
    ticks: i64,
}

impl Script for FollowCamera {
    fn name(&self) -> &str {
        "game.FollowCamera"
    }

    fn load(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _ctx: &mut ScriptContext<'_>, _dt: f64) -> Result<()> {
        self.ticks += 1;
        Ok(())
    }

    fn invoke(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        method: &str,
        _args: &[ScriptValue],
    ) -> Option<Result<ScriptValue>> {
        (method == "ticks").then(|| Ok(ScriptValue::Int(self.ticks)))
    }
}

fn player() -> Box<dyn Script> {
    Box::new(Player::default())
}

fn follow_camera() -> Box<dyn Script> {
    Box::new(FollowCamera::default())
}

unsafe extern "C" fn create_registry(_args: ArgsHandle) -> ObjectHandle {
    ObjectHandle::guarded(|| {
        let registry = ManifestRegistry::embedded(include_str!("../scripts.json"))
            .with_factory("game.Player", player)
            .with_factory("game.FollowCamera", follow_camera)
            .build()
            .ok()?;
        Some(ScriptObject::Registry(Box::new(registry)))
    })
}

unsafe extern "C" fn create_player(_args: ArgsHandle) -> ObjectHandle {
    ObjectHandle::script(Player::default())
}

unsafe extern "C" fn create_follow_camera(_args: ArgsHandle) -> ObjectHandle {
    ObjectHandle::script(FollowCamera::default())
}

kestrel_scripts::export_script_types! {
    "kestrel.scripts.ScriptRegistry" => create_registry,
    "game.Player" => create_player,
    "game.FollowCamera" => create_follow_camera,
}
