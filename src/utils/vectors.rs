use std::{fmt::Display, iter::Sum};

use auto_ops::impl_op_ex;
use serde::{Deserialize, Serialize};

use crate::Float;

/// A Lorentz four-momentum in GeV, stored as Cartesian components `(px, py, pz, E)`.
///
/// Detector-level quantities arrive as `(pt, eta, phi, E)`, so most vectors are created with
/// [`Vec4::from_pt_eta_phi_e`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    /// Momentum along the x-axis
    pub px: Float,
    /// Momentum along the y-axis
    pub py: Float,
    /// Momentum along the z-axis (beam axis)
    pub pz: Float,
    /// Energy
    pub e: Float,
}

impl Display for Vec4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[e = {:.5}; p = ({:.5}, {:.5}, {:.5}); m = {:.5}]",
            self.e,
            self.px,
            self.py,
            self.pz,
            self.m()
        )
    }
}

impl Vec4 {
    /// Create a new [`Vec4`] from its Cartesian components.
    pub fn new(px: Float, py: Float, pz: Float, e: Float) -> Self {
        Self { px, py, pz, e }
    }

    /// Create a new [`Vec4`] from transverse momentum, pseudorapidity, azimuthal angle and energy.
    pub fn from_pt_eta_phi_e(pt: Float, eta: Float, phi: Float, e: Float) -> Self {
        Self {
            px: pt * phi.cos(),
            py: pt * phi.sin(),
            pz: pt * eta.sinh(),
            e,
        }
    }

    /// The transverse momentum.
    pub fn pt(&self) -> Float {
        self.px.hypot(self.py)
    }

    /// The magnitude of the three-momentum.
    pub fn p(&self) -> Float {
        (self.px * self.px + self.py * self.py + self.pz * self.pz).sqrt()
    }

    /// The pseudorapidity. Vectors along the beam axis give `±inf`.
    pub fn eta(&self) -> Float {
        (self.pz / self.pt()).asinh()
    }

    /// The azimuthal angle in `(-pi, pi]`.
    pub fn phi(&self) -> Float {
        self.py.atan2(self.px)
    }

    /// The squared invariant mass, $`E^2 - |\vec{p}|^2`$.
    pub fn m2(&self) -> Float {
        self.e * self.e - (self.px * self.px + self.py * self.py + self.pz * self.pz)
    }

    /// The invariant mass.
    ///
    /// A negative squared mass (which only arises from rounding for nearly massless systems)
    /// yields a negative mass of the same magnitude rather than `NaN`.
    pub fn m(&self) -> Float {
        let m2 = self.m2();
        if m2 < 0.0 {
            -(-m2).sqrt()
        } else {
            m2.sqrt()
        }
    }

    fn add(&self, other: &Self) -> Self {
        Self {
            px: self.px + other.px,
            py: self.py + other.py,
            pz: self.pz + other.pz,
            e: self.e + other.e,
        }
    }

    fn sub(&self, other: &Self) -> Self {
        Self {
            px: self.px - other.px,
            py: self.py - other.py,
            pz: self.pz - other.pz,
            e: self.e - other.e,
        }
    }

    fn neg(&self) -> Self {
        Self {
            px: -self.px,
            py: -self.py,
            pz: -self.pz,
            e: -self.e,
        }
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 { a.add(b) });
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 { a.sub(b) });
impl_op_ex!(-|a: &Vec4| -> Vec4 { a.neg() });

impl Sum for Vec4 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, v| acc + v)
    }
}

impl<'a> Sum<&'a Vec4> for Vec4 {
    fn sum<I: Iterator<Item = &'a Vec4>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, v| acc + v)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    use super::*;

    #[test]
    fn test_vec_sums() {
        let a = Vec4::new(1.0, 2.0, 3.0, 10.0);
        let b = Vec4::new(4.0, 5.0, 6.0, 20.0);
        let c = a + b;
        assert_eq!(c, Vec4::new(5.0, 7.0, 9.0, 30.0));
        let d = c - b;
        assert_eq!(d, a);
        assert_eq!(-a, Vec4::new(-1.0, -2.0, -3.0, -10.0));
        let total: Vec4 = [a, b].iter().sum();
        assert_eq!(total, c);
    }

    #[test]
    fn test_detector_coordinates() {
        let v = Vec4::from_pt_eta_phi_e(10.0, 0.5, FRAC_PI_2, 20.0);
        assert_relative_eq!(v.px, 0.0, epsilon = 1e-12);
        assert_relative_eq!(v.py, 10.0, epsilon = 1e-12);
        assert_relative_eq!(v.pz, 10.0 * 0.5f64.sinh(), epsilon = 1e-12);
        assert_relative_eq!(v.pt(), 10.0, epsilon = 1e-12);
        assert_relative_eq!(v.eta(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(v.phi(), FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_mass() {
        let v = Vec4::new(1.0, 2.0, 3.0, 10.0);
        assert_relative_eq!(v.m2(), 86.0);
        assert_relative_eq!(v.m(), 86.0f64.sqrt());
        let spacelike = Vec4::new(0.0, 0.0, 2.0, 1.0);
        assert_relative_eq!(spacelike.m(), -(3.0f64.sqrt()));
    }

    #[test]
    fn test_back_to_back_pair_mass() {
        // two massless 45 GeV leptons, back to back, form a 90 GeV system at rest
        let a = Vec4::from_pt_eta_phi_e(45.0, 0.0, 0.0, 45.0);
        let b = Vec4::from_pt_eta_phi_e(45.0, 0.0, std::f64::consts::PI, 45.0);
        assert_relative_eq!((a + b).m(), 90.0, epsilon = 1e-9);
    }
}
