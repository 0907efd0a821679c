//! Triangle-mesh target surface: closest-point queries and OBJ I/O.

use crate::types::{ErodError, ErodResult};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Which feature of a triangle the closest point lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosestRegion {
    Face,
    /// Local corner indices (0..3) of the edge endpoints.
    Edge(usize, usize),
    Vertex(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct ClosestPoint {
    pub point: Vector3<f64>,
    pub triangle: usize,
    pub region: ClosestRegion,
    pub distance: f64,
}

/// A fixed triangle mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSurface {
    vertices: Array2<f64>, // nv × 3
    triangles: Vec<[usize; 3]>,
}

impl TargetSurface {
    pub fn new(vertices: Array2<f64>, triangles: Vec<[usize; 3]>) -> ErodResult<Self> {
        if vertices.ncols() != 3 {
            return Err(ErodError::Dimension { what: "surface vertex columns", expected: 3, got: vertices.ncols() });
        }
        if triangles.is_empty() {
            return Err(ErodError::InvalidInput("target surface has no triangles".into()));
        }
        let nv = vertices.nrows();
        for tri in &triangles {
            for &v in tri {
                if v >= nv {
                    return Err(ErodError::IndexOutOfRange { what: "surface vertex", index: v, len: nv });
                }
            }
        }
        Ok(Self { vertices, triangles })
    }

    /// Build from packed coordinate and index arrays.
    pub fn from_flat(vertices: &[f64], triangles: &[usize]) -> ErodResult<Self> {
        if vertices.len() % 3 != 0 || triangles.len() % 3 != 0 {
            return Err(ErodError::InvalidInput("surface arrays must hold triples".into()));
        }
        let v = Array2::from_shape_vec((vertices.len() / 3, 3), vertices.to_vec())
            .map_err(|e| ErodError::InvalidInput(e.to_string()))?;
        let t = triangles.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
        Self::new(v, t)
    }

    pub fn vertices(&self) -> &Array2<f64> {
        &self.vertices
    }
    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    fn corner(&self, v: usize) -> Vector3<f64> {
        Vector3::new(self.vertices[[v, 0]], self.vertices[[v, 1]], self.vertices[[v, 2]])
    }

    pub fn triangle_corners(&self, t: usize) -> [Vector3<f64>; 3] {
        self.triangles[t].map(|v| self.corner(v))
    }

    /// Closest point on the whole surface (brute force over triangles).
    pub fn closest_point(&self, p: &Vector3<f64>) -> ClosestPoint {
        let mut best = ClosestPoint {
            point: Vector3::zeros(),
            triangle: 0,
            region: ClosestRegion::Face,
            distance: f64::INFINITY,
        };
        for t in 0..self.triangles.len() {
            let [a, b, c] = self.triangle_corners(t);
            let (point, region) = closest_point_on_triangle(p, &a, &b, &c);
            let distance = (p - point).norm();
            if distance < best.distance {
                best = ClosestPoint { point, triangle: t, region, distance };
            }
        }
        best
    }

    /// Jacobian ∂cp/∂p of the closest-point map: the projector onto the
    /// tangent space of the closest feature.
    pub fn closest_point_sensitivity(&self, cp: &ClosestPoint) -> Matrix3<f64> {
        let [a, b, c] = self.triangle_corners(cp.triangle);
        match cp.region {
            ClosestRegion::Face => {
                let n = (b - a).cross(&(c - a));
                let nn = n.norm();
                if nn == 0.0 {
                    return Matrix3::zeros();
                }
                let n = n / nn;
                Matrix3::identity() - n * n.transpose()
            }
            ClosestRegion::Edge(i, j) => {
                let corners = [a, b, c];
                let t = corners[j] - corners[i];
                let tn = t.norm();
                if tn == 0.0 {
                    return Matrix3::zeros();
                }
                let t = t / tn;
                t * t.transpose()
            }
            ClosestRegion::Vertex(_) => Matrix3::zeros(),
        }
    }

    // ── OBJ I/O ───────────────────────────────────────────

    /// Read `v` and `f` records of a Wavefront OBJ file.  Polygon faces are
    /// fan-triangulated; `v/vt/vn` index forms and negative (relative)
    /// indices are accepted.
    pub fn load_obj<P: AsRef<Path>>(path: P) -> ErodResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::read_obj(BufReader::new(file))
    }

    pub fn read_obj<R: BufRead>(reader: R) -> ErodResult<Self> {
        let mut coords: Vec<f64> = Vec::new();
        let mut triangles = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("v") => {
                    for _ in 0..3 {
                        let tok = tokens.next().ok_or_else(|| ErodError::MeshFormat {
                            line: lineno + 1,
                            msg: "vertex record needs three coordinates".into(),
                        })?;
                        let val: f64 = tok.parse().map_err(|_| ErodError::MeshFormat {
                            line: lineno + 1,
                            msg: format!("bad coordinate '{tok}'"),
                        })?;
                        coords.push(val);
                    }
                }
                Some("f") => {
                    let nv = coords.len() / 3;
                    let mut poly = Vec::new();
                    for tok in tokens {
                        let idx_str = tok.split('/').next().unwrap_or("");
                        let idx: i64 = idx_str.parse().map_err(|_| ErodError::MeshFormat {
                            line: lineno + 1,
                            msg: format!("bad face index '{tok}'"),
                        })?;
                        let resolved = if idx > 0 { idx - 1 } else { nv as i64 + idx };
                        if resolved < 0 || resolved as usize >= nv {
                            return Err(ErodError::MeshFormat {
                                line: lineno + 1,
                                msg: format!("face index {idx} out of range"),
                            });
                        }
                        poly.push(resolved as usize);
                    }
                    if poly.len() < 3 {
                        return Err(ErodError::MeshFormat { line: lineno + 1, msg: "face with fewer than 3 corners".into() });
                    }
                    for k in 1..poly.len() - 1 {
                        triangles.push([poly[0], poly[k], poly[k + 1]]);
                    }
                }
                _ => {}
            }
        }
        let v = Array2::from_shape_vec((coords.len() / 3, 3), coords)
            .map_err(|e| ErodError::InvalidInput(e.to_string()))?;
        Self::new(v, triangles)
    }

    pub fn save_obj<P: AsRef<Path>>(&self, path: P) -> ErodResult<()> {
        let file = std::fs::File::create(path)?;
        let mut w = BufWriter::new(file);
        w.write_all(self.to_obj_string().as_bytes())?;
        w.flush()?;
        Ok(())
    }

    pub fn to_obj_string(&self) -> String {
        let mut s = String::new();
        for row in self.vertices.rows() {
            let _ = writeln!(s, "v {:.17e} {:.17e} {:.17e}", row[0], row[1], row[2]);
        }
        for t in &self.triangles {
            let _ = writeln!(s, "f {} {} {}", t[0] + 1, t[1] + 1, t[2] + 1);
        }
        s
    }
}

// ─────────────────────────────────────────────────────────────
//  Point–triangle projection (barycentric region test)
// ─────────────────────────────────────────────────────────────

/// Closest point of triangle (a, b, c) to `p`, with the feature it lies on.
pub fn closest_point_on_triangle(
    p: &Vector3<f64>,
    a: &Vector3<f64>,
    b: &Vector3<f64>,
    c: &Vector3<f64>,
) -> (Vector3<f64>, ClosestRegion) {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return (*a, ClosestRegion::Vertex(0));
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return (*b, ClosestRegion::Vertex(1));
    }

    let vc = d1.mul_add(d4, -(d3 * d2));
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return (a + ab * v, ClosestRegion::Edge(0, 1));
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return (*c, ClosestRegion::Vertex(2));
    }

    let vb = d5.mul_add(d2, -(d1 * d6));
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return (a + ac * w, ClosestRegion::Edge(0, 2));
    }

    let va = d3.mul_add(d6, -(d5 * d4));
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return (b + (c - b) * w, ClosestRegion::Edge(1, 2));
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    (a + ab * v + ac * w, ClosestRegion::Face)
}
