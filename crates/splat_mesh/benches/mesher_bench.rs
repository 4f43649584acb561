//! Welder throughput over synthetic tile meshes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use splat_mesh::mesh::{HostKeyMesh, MesherWork};
use splat_mesh::mesher::{OocMesher, PASS_COUNT, PASS_EMIT};
use splat_mesh::ply::writer::MemoryPlyWriter;
use splat_mesh::ply::Namer;
use splat_mesh::types::ChunkId;

/// A strip of quads whose boundary vertices carry keys shared with the next
/// block, mimicking tiles meeting along a face.
fn strip_block(block: u32, quads: u32) -> MesherWork {
  let mut vertices = Vec::new();
  let mut external = Vec::new();
  let mut keys = Vec::new();
  let mut triangles = Vec::new();

  // Interior vertices.
  for i in 0..=quads {
    vertices.push([block as f32, i as f32, 0.0]);
  }
  let num_internal = vertices.len() as u64;
  // Shared columns with both neighbours.
  for x in [block as u64, block as u64 + 1] {
    for i in 0..=quads {
      external.push([x as f32 + 0.5, i as f32, 1.0]);
      keys.push((x << 32) | i as u64);
    }
  }
  let column = quads + 1;
  for i in 0..quads {
    let a = i;
    let b = i + 1;
    let left = num_internal as u32 + i;
    let right = num_internal as u32 + column + i;
    triangles.push([a, b, left]);
    triangles.push([b, right, left]);
  }

  let mut all = vertices;
  all.extend_from_slice(&external);
  MesherWork {
    chunk_id: ChunkId::default(),
    mesh: HostKeyMesh {
      vertices: all,
      external_keys: keys,
      num_internal,
      triangles,
    },
  }
}

fn bench_weld(c: &mut Criterion) {
  let blocks: Vec<MesherWork> = (0..64).map(|b| strip_block(b, 128)).collect();

  c.bench_function("weld_64_blocks", |bencher| {
    bencher.iter(|| {
      let mut mesher = OocMesher::new();
      mesher.begin_pass(PASS_COUNT).unwrap();
      for block in &blocks {
        mesher.add(black_box(block)).unwrap();
      }
      mesher.begin_pass(PASS_EMIT).unwrap();
      for block in &blocks {
        mesher.add(black_box(block)).unwrap();
      }
      let mut writer = MemoryPlyWriter::new();
      mesher.write(&mut writer, &Namer::Trivial(String::new())).unwrap();
      black_box(writer.num_outputs())
    })
  });
}

criterion_group!(benches, bench_weld);
criterion_main!(benches);
