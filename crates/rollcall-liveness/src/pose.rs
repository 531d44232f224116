//! Head pose from six facial landmarks.
//!
//! A damped Gauss-Newton perspective-n-point solve against a fixed
//! anthropometric head model, assuming a pinhole camera whose focal length
//! equals the frame width and whose principal point is the frame center.

use crate::FaceLandmarks;

/// 3D head model anchors, in the same order as
/// [`FaceLandmarks::pose_points`]: nose tip, chin, left eye outer corner,
/// right eye outer corner, left mouth corner, right mouth corner.
/// Millimeter-scale coordinates with the nose tip at the origin.
const MODEL_POINTS: [[f64; 3]; 6] = [
    [0.0, 0.0, 0.0],
    [0.0, -330.0, -65.0],
    [-225.0, 170.0, -135.0],
    [225.0, 170.0, -135.0],
    [-150.0, -150.0, -125.0],
    [150.0, -150.0, -125.0],
];

const MAX_ITERATIONS: usize = 50;
const STEP_EPSILON: f64 = 1e-8;
const JACOBIAN_DELTA: f64 = 1e-5;

/// Euler angles in degrees. Positive yaw = face turned toward the camera's
/// left edge; positive pitch = chin lifted.
#[derive(Debug, Clone, Copy)]
pub struct HeadPose {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// Rotation matrix from a Rodrigues axis-angle vector.
fn rodrigues(rvec: [f64; 3]) -> [[f64; 3]; 3] {
    let theta = (rvec[0] * rvec[0] + rvec[1] * rvec[1] + rvec[2] * rvec[2]).sqrt();
    if theta < 1e-12 {
        return [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    }
    let (kx, ky, kz) = (rvec[0] / theta, rvec[1] / theta, rvec[2] / theta);
    let (s, c) = theta.sin_cos();
    let v = 1.0 - c;

    [
        [
            c + kx * kx * v,
            kx * ky * v - kz * s,
            kx * kz * v + ky * s,
        ],
        [
            ky * kx * v + kz * s,
            c + ky * ky * v,
            ky * kz * v - kx * s,
        ],
        [
            kz * kx * v - ky * s,
            kz * ky * v + kx * s,
            c + kz * kz * v,
        ],
    ]
}

/// Project one model point through pose parameters `[rx, ry, rz, tx, ty, tz]`.
fn project(params: &[f64; 6], point: &[f64; 3], focal: f64, cx: f64, cy: f64) -> Option<(f64, f64)> {
    let r = rodrigues([params[0], params[1], params[2]]);
    let x = r[0][0] * point[0] + r[0][1] * point[1] + r[0][2] * point[2] + params[3];
    let y = r[1][0] * point[0] + r[1][1] * point[1] + r[1][2] * point[2] + params[4];
    let z = r[2][0] * point[0] + r[2][1] * point[1] + r[2][2] * point[2] + params[5];
    if z <= 1e-6 {
        return None;
    }
    Some((focal * x / z + cx, focal * y / z + cy))
}

/// Stacked reprojection residuals for all six points.
fn residuals(params: &[f64; 6], image: &[(f32, f32); 6], focal: f64, cx: f64, cy: f64) -> Option<[f64; 12]> {
    let mut r = [0.0f64; 12];
    for (i, point) in MODEL_POINTS.iter().enumerate() {
        let (u, v) = project(params, point, focal, cx, cy)?;
        r[i * 2] = u - image[i].0 as f64;
        r[i * 2 + 1] = v - image[i].1 as f64;
    }
    Some(r)
}

/// Solve a 6×6 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_6x6(a: &[[f64; 6]; 6], b: &[f64; 6]) -> Option<[f64; 6]> {
    let mut m = [[0.0f64; 7]; 6];
    for i in 0..6 {
        m[i][..6].copy_from_slice(&a[i]);
        m[i][6] = b[i];
    }

    for col in 0..6 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..6 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..6 {
            let factor = m[row][col] / pivot;
            for j in col..7 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 6];
    for i in (0..6).rev() {
        x[i] = m[i][6];
        for j in (i + 1)..6 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    Some(x)
}

/// Euler angles (degrees) from a rotation matrix, R = Rx(pitch)·Ry(yaw)·Rz(roll).
fn euler_angles(r: &[[f64; 3]; 3]) -> HeadPose {
    let yaw = r[0][2].clamp(-1.0, 1.0).asin();
    let roll = (-r[0][1]).atan2(r[0][0]);
    let pitch = (-r[1][2]).atan2(r[2][2]);
    HeadPose {
        yaw: yaw.to_degrees(),
        pitch: pitch.to_degrees(),
        roll: roll.to_degrees(),
    }
}

/// Estimate head pose from the six landmark anchors.
///
/// Returns `None` when the optimization degenerates (singular normal
/// equations or a pose that puts the head behind the camera). Initial guess
/// places the head on the optical axis at roughly arm's length.
pub fn solve_head_pose(landmarks: &FaceLandmarks, frame_width: u32, frame_height: u32) -> Option<HeadPose> {
    let focal = frame_width as f64;
    let cx = frame_width as f64 / 2.0;
    let cy = frame_height as f64 / 2.0;
    let image = &landmarks.pose_points;

    let mut params = [0.0, 0.0, 0.0, 0.0, 0.0, focal];
    let mut lambda = 1e-3;
    let mut current = residuals(&params, image, focal, cx, cy)?;

    for _ in 0..MAX_ITERATIONS {
        // Central-difference Jacobian, 12 residuals × 6 parameters.
        let mut jac = [[0.0f64; 6]; 12];
        for p in 0..6 {
            let delta = JACOBIAN_DELTA * params[p].abs().max(1.0);
            let mut plus = params;
            plus[p] += delta;
            let mut minus = params;
            minus[p] -= delta;
            let rp = residuals(&plus, image, focal, cx, cy)?;
            let rm = residuals(&minus, image, focal, cx, cy)?;
            for i in 0..12 {
                jac[i][p] = (rp[i] - rm[i]) / (2.0 * delta);
            }
        }

        // Normal equations with Levenberg damping.
        let mut jtj = [[0.0f64; 6]; 6];
        let mut jtr = [0.0f64; 6];
        for i in 0..12 {
            for p in 0..6 {
                for q in 0..6 {
                    jtj[p][q] += jac[i][p] * jac[i][q];
                }
                jtr[p] += jac[i][p] * current[i];
            }
        }
        for p in 0..6 {
            jtj[p][p] *= 1.0 + lambda;
        }

        let step = solve_6x6(&jtj, &jtr)?;
        let mut next = params;
        for p in 0..6 {
            next[p] -= step[p];
        }

        match residuals(&next, image, focal, cx, cy) {
            Some(next_res) if sum_sq(&next_res) < sum_sq(&current) => {
                params = next;
                current = next_res;
                lambda = (lambda * 0.5).max(1e-9);
                if step.iter().map(|s| s * s).sum::<f64>().sqrt() < STEP_EPSILON {
                    break;
                }
            }
            _ => {
                lambda *= 10.0;
                if lambda > 1e6 {
                    break;
                }
            }
        }
    }

    if params[5] <= 0.0 {
        return None;
    }
    Some(euler_angles(&rodrigues([params[0], params[1], params[2]])))
}

fn sum_sq(r: &[f64; 12]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTH: u32 = 640;
    const HEIGHT: u32 = 480;

    /// Project the model through a known pose to make synthetic landmarks.
    fn landmarks_for(params: [f64; 6]) -> FaceLandmarks {
        let focal = WIDTH as f64;
        let cx = WIDTH as f64 / 2.0;
        let cy = HEIGHT as f64 / 2.0;
        let mut pose_points = [(0.0f32, 0.0f32); 6];
        for (i, point) in MODEL_POINTS.iter().enumerate() {
            let (u, v) = project(&params, point, focal, cx, cy).unwrap();
            pose_points[i] = (u as f32, v as f32);
        }
        FaceLandmarks {
            left_eye: [(0.0, 0.0); 6],
            right_eye: [(0.0, 0.0); 6],
            pose_points,
        }
    }

    #[test]
    fn test_frontal_pose_near_zero_angles() {
        let lm = landmarks_for([0.0, 0.0, 0.0, 0.0, 0.0, 900.0]);
        let pose = solve_head_pose(&lm, WIDTH, HEIGHT).unwrap();
        assert!(pose.yaw.abs() < 2.0, "yaw = {}", pose.yaw);
        assert!(pose.pitch.abs() < 2.0, "pitch = {}", pose.pitch);
        assert!(pose.roll.abs() < 2.0, "roll = {}", pose.roll);
    }

    #[test]
    fn test_yaw_rotation_recovered() {
        let theta = 20.0f64.to_radians();
        let lm = landmarks_for([0.0, theta, 0.0, 0.0, 0.0, 900.0]);
        let pose = solve_head_pose(&lm, WIDTH, HEIGHT).unwrap();
        assert!((pose.yaw - 20.0).abs() < 5.0, "yaw = {}", pose.yaw);
        assert!(pose.pitch.abs() < 5.0, "pitch = {}", pose.pitch);
    }

    #[test]
    fn test_pitch_rotation_recovered() {
        let theta = 15.0f64.to_radians();
        let lm = landmarks_for([theta, 0.0, 0.0, 0.0, 0.0, 900.0]);
        let pose = solve_head_pose(&lm, WIDTH, HEIGHT).unwrap();
        assert!((pose.pitch - 15.0).abs() < 5.0, "pitch = {}", pose.pitch);
        assert!(pose.yaw.abs() < 5.0, "yaw = {}", pose.yaw);
    }

    #[test]
    fn test_degenerate_landmarks_fail_soft() {
        let lm = FaceLandmarks {
            left_eye: [(0.0, 0.0); 6],
            right_eye: [(0.0, 0.0); 6],
            pose_points: [(100.0, 100.0); 6],
        };
        // All landmarks collapsed to one point: must not panic.
        let _ = solve_head_pose(&lm, WIDTH, HEIGHT);
    }

    #[test]
    fn test_rodrigues_identity() {
        let r = rodrigues([0.0, 0.0, 0.0]);
        for (i, row) in r.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_rodrigues_quarter_turn_about_z() {
        let r = rodrigues([0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        // Rotating +x by 90° about z gives +y.
        let x = [r[0][0], r[1][0], r[2][0]];
        assert!(x[0].abs() < 1e-9);
        assert!((x[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_solve_6x6_identity() {
        let mut a = [[0.0f64; 6]; 6];
        for i in 0..6 {
            a[i][i] = 1.0;
        }
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = solve_6x6(&a, &b).unwrap();
        for i in 0..6 {
            assert!((x[i] - b[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_solve_6x6_singular_is_none() {
        let a = [[0.0f64; 6]; 6];
        let b = [1.0; 6];
        assert!(solve_6x6(&a, &b).is_none());
    }
}
