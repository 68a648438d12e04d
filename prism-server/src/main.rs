//! Authoritative scene server: owns a demo scene and streams it to whoever
//! connects. Resources are built procedurally here; the core only ever sees
//! in-memory buffers.

use clap::Parser;
use nalgebra_glm as glm;
use prism::config::Config;
use prism::hashing::{sid, StringId, SID_NONE};
use prism::logging;
use prism::server::{serve, Stage, World};
use prism::store::Material;
use prism::sync::CancelToken;
use prism::transform::Transform;
use prism::wire::geometry::Vertex;
use prism::wire::tcp::{MeshInfo, PointLightInfo, TextureFormat, LIGHT_DYN_COLOR, LIGHT_DYN_INTENSITY};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "prism-server", about = "Streams an authoritative 3D scene to a rendering client")]
struct Args {
    /// Raise log verbosity one level per repetition
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable ANSI colours in log output
    #[arg(short = 'n')]
    no_color: bool,

    /// TOML configuration file (ports, limiter, timeouts)
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    let log = logging::terminal(args.verbose, !args.no_color);

    let config = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(err) => {
                logging::crit!(log, "failed to load config"; "error" => %err);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    let world = build_demo_world(&log);
    let cancel = CancelToken::new();

    let mut make_stage: Box<dyn FnMut() -> Box<dyn Stage>> = Box::new(|| {
        Box::new(DemoStage {
            t: 0.0,
            model: sid("demo/wave"),
            light: sid("demo/lamp"),
        })
    });

    if let Err(err) = serve(&world, &config, &mut *make_stage, &cancel, &log) {
        logging::crit!(log, "server failed"; "error" => ?err);
        process::exit(1);
    }
}

/// An 8x8 vertex grid with a checker texture and one dynamic light.
fn build_demo_world(log: &logging::Logger) -> World {
    let world = World::new(64 * 1024 * 1024, log);

    let mut checker = Vec::with_capacity(4 * 4 * 4);
    for y in 0..4 {
        for x in 0..4 {
            let on = (x + y) % 2 == 0;
            let value = if on { 0xff } else { 0x20 };
            checker.extend_from_slice(&[value, value, value, 0xff]);
        }
    }
    world.register_texture(sid("demo/checker"), TextureFormat::Rgba, &checker);

    world.register_material(
        sid("demo/mat"),
        Material {
            diffuse: sid("demo/checker"),
            specular: SID_NONE,
            normal: SID_NONE,
        },
    );

    world.register_point_light(PointLightInfo {
        name: sid("demo/lamp"),
        position: [0.0, 3.0, 0.0],
        color: [1.0, 0.95, 0.9],
        intensity: 2.0,
        dyn_mask: LIGHT_DYN_COLOR | LIGHT_DYN_INTENSITY,
    });

    const GRID: usize = 8;
    let mut vertices = Vec::new();
    for row in 0..GRID {
        for col in 0..GRID {
            let vertex = Vertex {
                pos: [col as f32, 0.0, row as f32],
                normal: [0.0, 1.0, 0.0],
                uv: [col as f32 / (GRID - 1) as f32, row as f32 / (GRID - 1) as f32],
            };
            vertex.encode(&mut vertices).expect("sized buffer");
        }
    }

    let mut indices = Vec::new();
    let mut n_indices = 0u32;
    for row in 0..GRID - 1 {
        for col in 0..GRID - 1 {
            let base = (row * GRID + col) as u32;
            for &index in &[
                base,
                base + 1,
                base + GRID as u32,
                base + 1,
                base + GRID as u32 + 1,
                base + GRID as u32,
            ] {
                indices.extend_from_slice(&index.to_le_bytes());
                n_indices += 1;
            }
        }
    }

    world.register_model(
        sid("demo/wave"),
        vec![sid("demo/mat")],
        vec![MeshInfo {
            offset: 0,
            len: n_indices,
            material: 0,
        }],
        &vertices,
        &indices,
    );

    world
}

/// Spins the grid and breathes the light, feeding the update queues each
/// tick.
struct DemoStage {
    t: f32,
    model: StringId,
    light: StringId,
}

impl Stage for DemoStage {
    fn tick(&mut self, world: &World) {
        self.t += 0.033;

        let rotation = glm::quat_angle_axis(self.t * 0.5, &glm::vec3(0.0, 1.0, 0.0));
        world.set_transform(self.model, Transform::default().with_rotation(rotation));

        let warm = 0.75 + 0.25 * self.t.sin();
        world.set_light(self.light, [1.0, warm, warm * 0.8], 2.0 + self.t.cos());
    }
}
