use crate::{data::Event, delivery::FileMetadata, Float, HzzError, HzzResult};

/// Picobarns per inverse femtobarn of luminosity.
const PB_PER_FB: Float = 1000.0;

/// The per-file normalization of simulated events to the integrated luminosity:
///
/// ```math
/// w_{\sigma} = \frac{\sigma\,[\text{pb}] \cdot 1000 \cdot L\,[\text{fb}^{-1}]}{\sum w_{\text{MC}} \cdot \epsilon_{\text{filter}}}
/// ```
///
/// Collision data is never rescaled and gets a weight of `1`.
pub fn cross_section_weight(metadata: &FileMetadata, luminosity: Float) -> HzzResult<Float> {
    if metadata.is_data {
        return Ok(1.0);
    }
    let denominator = metadata.sum_of_weights * metadata.filter_efficiency;
    if !(denominator > 0.0) {
        return Err(HzzError::Custom(format!(
            "cannot normalize \"{}\": sum of weights times filter efficiency is {}",
            metadata.path, denominator
        )));
    }
    Ok(metadata.cross_section * PB_PER_FB * luminosity / denominator)
}

/// The nominal weight of a simulated event: the cross-section weight times the generator weight
/// and all scale factors.
pub fn event_weight(event: &Event, cross_section_weight: Float) -> Float {
    cross_section_weight
        * event.mc_weight
        * event.scale_factor_pileup
        * event.scale_factor_ele
        * event.scale_factor_muon
        * event.scale_factor_lep_trigger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_event;
    use approx::assert_relative_eq;

    #[test]
    fn test_cross_section_weight() {
        let ggh = FileMetadata::simulation("Signal", "ggH.parquet", 0.0060239, 27881776.6536, 1.0);
        assert_relative_eq!(
            cross_section_weight(&ggh, 10.0).unwrap(),
            0.0060239 * 1000.0 * 10.0 / 27881776.6536
        );
        let filtered = FileMetadata::simulation("Background", "zz.parquet", 2.0, 100.0, 0.5);
        assert_relative_eq!(cross_section_weight(&filtered, 1.0).unwrap(), 40.0);
        let data = FileMetadata::data("Data", "data_A.parquet");
        assert_eq!(cross_section_weight(&data, 10.0).unwrap(), 1.0);
    }

    #[test]
    fn test_zero_sum_of_weights_is_an_error() {
        let broken = FileMetadata::simulation("Signal", "ggH.parquet", 1.0, 0.0, 1.0);
        assert!(cross_section_weight(&broken, 10.0).is_err());
    }

    #[test]
    fn test_event_weight() {
        let event = test_event();
        assert_relative_eq!(
            event_weight(&event, 2.0),
            2.0 * 0.8 * 1.1 * 0.95 * 0.98 * 1.0,
            epsilon = 1e-12
        );
    }
}
